//! JSON bodies shared by the control plane and the runner agent.
//!
//! All timestamps are integer epoch milliseconds on the control plane's
//! clock. Every error response carries the [`ErrorBody`] envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::{AttemptStatus, LogStream, ResultStatus, RunStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub runner_id: i64,
    pub name: String,
    /// Raw runner token; returned exactly once at registration.
    pub token: String,
}

/// Everything a runner needs to execute a leased run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub run_id: i64,
    pub attempt_id: i64,
    pub attempt_no: i64,
    /// Raw lease token; the only credential for further attempt-scoped calls.
    pub lease_token: String,
    pub lease_expires_at: i64,
    pub input: Option<Value>,
    pub entrypoint: String,
    pub timeout_seconds: Option<i64>,
    pub artifact_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStateResponse {
    pub attempt_id: i64,
    pub attempt_no: i64,
    pub status: AttemptStatus,
    pub lease_expires_at: i64,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: i64,
    pub stream: LogStream,
    pub line: String,
    /// Client-side timestamp; the control plane stamps append time if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logged_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendLogsRequest {
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendLogsResponse {
    /// Lines actually inserted; duplicates on (attempt, seq) are dropped.
    pub accepted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRequest {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub app: String,
    #[serde(default)]
    pub environment: Option<String>,
    /// Specific version number; latest when absent.
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub id: i64,
    pub app_id: i64,
    pub run_no: i64,
    pub status: RunStatus,
    pub priority: i64,
    pub max_retries: i64,
    pub retry_count: i64,
    pub cancel_requested: bool,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub attempt_no: i64,
    pub seq: i64,
    pub stream: LogStream,
    pub line: String,
    pub logged_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: Vec<LogLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}
