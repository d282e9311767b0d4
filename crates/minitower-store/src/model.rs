//! Persisted entities.
//!
//! Field names match column names exactly; rows are decoded with `query_as`.
//! A run references its attempts by inverse lookup only (the attempt carries
//! `run_id`); the single active attempt is recovered by predicate query.

use minitower_core::{AttemptStatus, LogStream, RunStatus, RunnerStatus, TokenRole};
use serde_json::Value;
use sqlx::types::Json;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Team {
    pub id: i64,
    pub slug: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Environment {
    pub id: i64,
    pub team_id: i64,
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct App {
    pub id: i64,
    pub team_id: i64,
    pub slug: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppVersion {
    pub id: i64,
    pub app_id: i64,
    pub version: i64,
    pub entrypoint: String,
    pub timeout_seconds: Option<i64>,
    pub input_schema: Option<Json<Value>>,
    pub artifact_key: String,
    pub artifact_sha256: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiToken {
    pub id: i64,
    pub team_id: i64,
    pub token_hash: String,
    pub role: TokenRole,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Runner {
    pub id: i64,
    pub name: String,
    pub environment: String,
    pub token_hash: String,
    pub status: RunnerStatus,
    pub last_seen_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Run {
    pub id: i64,
    pub team_id: i64,
    pub app_id: i64,
    pub env_id: i64,
    pub version_id: i64,
    pub run_no: i64,
    pub input: Option<Json<Value>>,
    pub priority: i64,
    pub max_retries: i64,
    pub retry_count: i64,
    pub cancel_requested: bool,
    pub status: RunStatus,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunAttempt {
    pub id: i64,
    pub run_id: i64,
    pub attempt_no: i64,
    pub runner_id: i64,
    pub lease_token_hash: String,
    pub lease_expires_at: i64,
    pub status: AttemptStatus,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

/// One fetched log line, joined with its attempt number.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunLogLine {
    pub attempt_no: i64,
    pub seq: i64,
    pub stream: LogStream,
    pub line: String,
    pub logged_at: i64,
}
