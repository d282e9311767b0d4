//! Run lifecycle: creation, reads, and the user cancel path.

use minitower_core::{now_ms, RunStatus};
use serde_json::Value;
use sqlx::types::Json;

use crate::error::{Result, StoreError};
use crate::model::{App, AppVersion, Environment, Run, RunLogLine};
use crate::Store;

#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub team_id: i64,
    pub app_slug: &'a str,
    pub environment: &'a str,
    /// Specific version number; latest when `None`.
    pub version: Option<i64>,
    pub input: Option<Value>,
    pub priority: i64,
    pub max_retries: i64,
}

impl Store {
    /// Create a run in state `queued`, validating the input against the
    /// version's schema and assigning the per-app run number atomically.
    pub async fn create_run(&self, req: NewRun<'_>) -> Result<Run> {
        if req.max_retries < 0 {
            return Err(StoreError::InvalidInput("max_retries must be >= 0".into()));
        }

        let app: Option<App> = sqlx::query_as("SELECT * FROM apps WHERE team_id = ? AND slug = ?")
            .bind(req.team_id)
            .bind(req.app_slug)
            .fetch_optional(&self.read)
            .await?;
        let app = app.ok_or(StoreError::NotFound("app"))?;

        let env: Option<Environment> =
            sqlx::query_as("SELECT * FROM environments WHERE team_id = ? AND name = ?")
                .bind(req.team_id)
                .bind(req.environment)
                .fetch_optional(&self.read)
                .await?;
        let env = env.ok_or(StoreError::NotFound("environment"))?;

        let version: Option<AppVersion> = match req.version {
            Some(n) => {
                sqlx::query_as("SELECT * FROM app_versions WHERE app_id = ? AND version = ?")
                    .bind(app.id)
                    .bind(n)
                    .fetch_optional(&self.read)
                    .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM app_versions WHERE app_id = ? ORDER BY version DESC LIMIT 1",
                )
                .bind(app.id)
                .fetch_optional(&self.read)
                .await?
            }
        };
        let version = version.ok_or(StoreError::NotFound("version"))?;

        validate_input(&version, req.input.as_ref())?;

        let now = now_ms();
        let mut tx = self.write.begin().await?;

        let run_no: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(run_no), 0) + 1 FROM runs WHERE app_id = ?")
                .bind(app.id)
                .fetch_one(&mut *tx)
                .await?;

        let run: Run = sqlx::query_as(
            "INSERT INTO runs
               (team_id, app_id, env_id, version_id, run_no, input,
                priority, max_retries, status, queued_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'queued', ?)
             RETURNING *",
        )
        .bind(req.team_id)
        .bind(app.id)
        .bind(env.id)
        .bind(version.id)
        .bind(run_no)
        .bind(req.input.map(Json))
        .bind(req.priority)
        .bind(req.max_retries)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(run)
    }

    /// Read a run within the caller's team scope.
    pub async fn get_run(&self, team_id: i64, run_id: i64) -> Result<Run> {
        let run: Option<Run> = sqlx::query_as("SELECT * FROM runs WHERE id = ? AND team_id = ?")
            .bind(run_id)
            .bind(team_id)
            .fetch_optional(&self.read)
            .await?;
        run.ok_or(StoreError::NotFound("run"))
    }

    /// Request cancellation. Idempotent: a terminal run is returned unchanged,
    /// a queued run is cancelled eagerly, an in-flight run (and its active
    /// attempt) flips to `cancelling` for the runner to observe.
    pub async fn cancel_run(&self, team_id: i64, run_id: i64) -> Result<Run> {
        let now = now_ms();
        let mut tx = self.write.begin().await?;

        let run: Option<Run> = sqlx::query_as("SELECT * FROM runs WHERE id = ? AND team_id = ?")
            .bind(run_id)
            .bind(team_id)
            .fetch_optional(&mut *tx)
            .await?;
        let run = run.ok_or(StoreError::NotFound("run"))?;

        if run.status.is_terminal() {
            return Ok(run);
        }

        match run.status {
            RunStatus::Queued => {
                sqlx::query(
                    "UPDATE runs
                     SET status = 'cancelled', cancel_requested = 1, finished_at = ?
                     WHERE id = ? AND status = 'queued'",
                )
                .bind(now)
                .bind(run.id)
                .execute(&mut *tx)
                .await?;
            }
            RunStatus::Leased | RunStatus::Running => {
                sqlx::query(
                    "UPDATE runs
                     SET status = 'cancelling', cancel_requested = 1
                     WHERE id = ? AND status IN ('leased', 'running')",
                )
                .bind(run.id)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE run_attempts
                     SET status = 'cancelling'
                     WHERE run_id = ? AND status IN ('leased', 'running')",
                )
                .bind(run.id)
                .execute(&mut *tx)
                .await?;
            }
            RunStatus::Cancelling => {
                sqlx::query("UPDATE runs SET cancel_requested = 1 WHERE id = ?")
                    .bind(run.id)
                    .execute(&mut *tx)
                    .await?;
            }
            _ => unreachable!("terminal statuses returned above"),
        }

        let run: Run = sqlx::query_as("SELECT * FROM runs WHERE id = ?")
            .bind(run.id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(run)
    }

    /// All log lines of a run, ordered by attempt then sequence.
    pub async fn list_logs(&self, run_id: i64) -> Result<Vec<RunLogLine>> {
        Ok(sqlx::query_as(
            "SELECT a.attempt_no, l.seq, l.stream, l.line, l.logged_at
             FROM run_logs l
             JOIN run_attempts a ON a.id = l.attempt_id
             WHERE a.run_id = ?
             ORDER BY a.attempt_no ASC, l.seq ASC",
        )
        .bind(run_id)
        .fetch_all(&self.read)
        .await?)
    }
}

fn validate_input(version: &AppVersion, input: Option<&Value>) -> Result<()> {
    let Some(schema) = &version.input_schema else {
        return Ok(());
    };
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| StoreError::InvalidInput(format!("input schema: {e}")))?;

    let null = Value::Null;
    let instance = input.unwrap_or(&null);
    let errors: Vec<String> = match compiled.validate(instance) {
        Ok(()) => return Ok(()),
        Err(errs) => errs.map(|e| e.to_string()).collect(),
    };
    Err(StoreError::InvalidInput(errors.join("; ")))
}
