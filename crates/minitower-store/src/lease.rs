//! Lease dispatch and the lease-token-guarded attempt operations.
//!
//! Every mutation here runs as one transaction on the single writer
//! connection, so a CAS that reads then flips state cannot interleave with
//! another writer. The CAS predicates stay in the SQL anyway; a zero-row
//! update means someone else already made progress and the caller gets the
//! matching conflict error instead of a partial write.

use minitower_core::{now_ms, AttemptStatus, ResultStatus};
use minitower_core::wire::LogEntry;

use crate::error::{Result, StoreError};
use crate::model::{AppVersion, Run, RunAttempt, Runner};
use crate::Store;

/// A freshly leased run with everything the handler returns to the runner.
#[derive(Debug, Clone)]
pub struct Leased {
    pub run: Run,
    pub attempt: RunAttempt,
    pub version: AppVersion,
}

impl Store {
    /// Claim the next eligible run for `runner_id`.
    ///
    /// Selection is deterministic: highest priority, then oldest `queued_at`,
    /// then smallest id, filtered to the runner's environment label and to
    /// runs without a pending cancel. The CAS flip `queued -> leased`, the
    /// attempt insert, and the runner touch happen in the same transaction.
    pub async fn lease_run(
        &self,
        runner_id: i64,
        lease_token_hash: &str,
        ttl_ms: i64,
    ) -> Result<Leased> {
        let now = now_ms();
        let mut tx = self.write.begin().await?;

        let runner: Option<Runner> = sqlx::query_as("SELECT * FROM runners WHERE id = ?")
            .bind(runner_id)
            .fetch_optional(&mut *tx)
            .await?;
        let runner = runner.ok_or(StoreError::NotFound("runner"))?;

        let busy: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM run_attempts
             WHERE runner_id = ? AND status IN ('leased', 'running', 'cancelling')",
        )
        .bind(runner_id)
        .fetch_optional(&mut *tx)
        .await?;
        if busy.is_some() {
            return Err(StoreError::RunnerBusy);
        }

        // Polling proves liveness even when there is nothing to hand out.
        sqlx::query("UPDATE runners SET last_seen_at = ?, status = 'online' WHERE id = ?")
            .bind(now)
            .bind(runner_id)
            .execute(&mut *tx)
            .await?;

        let picked: Option<Run> = sqlx::query_as(
            "SELECT r.*
             FROM runs r
             JOIN environments e ON e.id = r.env_id
             WHERE r.status = 'queued' AND r.cancel_requested = 0 AND e.name = ?
             ORDER BY r.priority DESC, r.queued_at ASC, r.id ASC
             LIMIT 1",
        )
        .bind(&runner.environment)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(run) = picked else {
            tx.commit().await?;
            return Err(StoreError::NoWork);
        };

        let flipped = sqlx::query("UPDATE runs SET status = 'leased' WHERE id = ? AND status = 'queued'")
            .bind(run.id)
            .execute(&mut *tx)
            .await?;
        if flipped.rows_affected() == 0 {
            tx.commit().await?;
            return Err(StoreError::NoWork);
        }

        let attempt_no: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(attempt_no), 0) + 1 FROM run_attempts WHERE run_id = ?",
        )
        .bind(run.id)
        .fetch_one(&mut *tx)
        .await?;

        let attempt: RunAttempt = sqlx::query_as(
            "INSERT INTO run_attempts
               (run_id, attempt_no, runner_id, lease_token_hash, lease_expires_at,
                status, created_at)
             VALUES (?, ?, ?, ?, ?, 'leased', ?)
             RETURNING *",
        )
        .bind(run.id)
        .bind(attempt_no)
        .bind(runner_id)
        .bind(lease_token_hash)
        .bind(now + ttl_ms)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let run: Run = sqlx::query_as("SELECT * FROM runs WHERE id = ?")
            .bind(run.id)
            .fetch_one(&mut *tx)
            .await?;
        let version: AppVersion = sqlx::query_as("SELECT * FROM app_versions WHERE id = ?")
            .bind(run.version_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Leased {
            run,
            attempt,
            version,
        })
    }

    /// CAS the active attempt `leased -> running` and mark the run running.
    ///
    /// Idempotent when the attempt is already `running` under the same token;
    /// a `cancelling` attempt is returned as-is so the runner observes the
    /// cancel. Anything else is *invalid-lease*.
    pub async fn start_attempt(
        &self,
        run_id: i64,
        lease_token_hash: &str,
    ) -> Result<(RunAttempt, Run)> {
        let now = now_ms();
        let mut tx = self.write.begin().await?;

        let attempt = active_attempt(&mut tx, run_id).await?;
        let attempt = match attempt {
            Some(a) if a.lease_token_hash == lease_token_hash => a,
            _ => return Err(StoreError::InvalidLease),
        };

        if attempt.status == AttemptStatus::Leased {
            sqlx::query("UPDATE run_attempts SET status = 'running' WHERE id = ? AND status = 'leased'")
                .bind(attempt.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE runs
                 SET status = 'running', started_at = COALESCE(started_at, ?)
                 WHERE id = ? AND status IN ('leased', 'running')",
            )
            .bind(now)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        }

        let attempt: RunAttempt = sqlx::query_as("SELECT * FROM run_attempts WHERE id = ?")
            .bind(attempt.id)
            .fetch_one(&mut *tx)
            .await?;
        let run: Run = sqlx::query_as("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((attempt, run))
    }

    /// Heartbeat: push `lease_expires_at` forward while the attempt is live.
    pub async fn extend_lease(
        &self,
        run_id: i64,
        lease_token_hash: &str,
        ttl_ms: i64,
    ) -> Result<(RunAttempt, Run)> {
        let now = now_ms();
        let mut tx = self.write.begin().await?;

        let attempt = active_attempt(&mut tx, run_id).await?;
        let attempt = match attempt {
            Some(a) if a.lease_token_hash == lease_token_hash => a,
            _ => return Err(StoreError::InvalidLease),
        };

        // MAX keeps the expiry monotonic even if a delayed heartbeat lands
        // after a fresher one.
        sqlx::query(
            "UPDATE run_attempts
             SET lease_expires_at = MAX(lease_expires_at, ?)
             WHERE id = ? AND status IN ('leased', 'running', 'cancelling')",
        )
        .bind(now + ttl_ms)
        .bind(attempt.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE runners SET last_seen_at = ?, status = 'online' WHERE id = ?")
            .bind(now)
            .bind(attempt.runner_id)
            .execute(&mut *tx)
            .await?;

        let attempt: RunAttempt = sqlx::query_as("SELECT * FROM run_attempts WHERE id = ?")
            .bind(attempt.id)
            .fetch_one(&mut *tx)
            .await?;
        let run: Run = sqlx::query_as("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((attempt, run))
    }

    /// Append a log batch to the active attempt. Rows colliding on
    /// `(attempt, seq)` are dropped silently; the return value counts the
    /// lines actually inserted.
    pub async fn append_logs(
        &self,
        run_id: i64,
        lease_token_hash: &str,
        entries: &[LogEntry],
    ) -> Result<u64> {
        let now = now_ms();
        let mut tx = self.write.begin().await?;

        let attempt = match active_attempt(&mut tx, run_id).await? {
            Some(a) if a.lease_token_hash == lease_token_hash => a,
            Some(_) => return Err(StoreError::InvalidLease),
            None => {
                // Distinguish a finished attempt (log append barred) from a
                // token that never matched.
                let terminal: Option<i64> = sqlx::query_scalar(
                    "SELECT id FROM run_attempts
                     WHERE run_id = ? AND lease_token_hash = ?
                     ORDER BY attempt_no DESC LIMIT 1",
                )
                .bind(run_id)
                .bind(lease_token_hash)
                .fetch_optional(&mut *tx)
                .await?;
                return Err(match terminal {
                    Some(_) => StoreError::AttemptNotActive,
                    None => StoreError::InvalidLease,
                });
            }
        };

        let mut accepted = 0u64;
        for entry in entries {
            let res = sqlx::query(
                "INSERT OR IGNORE INTO run_logs (attempt_id, seq, stream, line, logged_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(attempt.id)
            .bind(entry.seq)
            .bind(entry.stream)
            .bind(&entry.line)
            .bind(entry.logged_at.unwrap_or(now))
            .execute(&mut *tx)
            .await?;
            accepted += res.rows_affected();
        }

        tx.commit().await?;
        Ok(accepted)
    }

    /// Submit a terminal result for the attempt bound to `lease_token_hash`.
    ///
    /// Re-submitting the same terminal status succeeds without a write. A
    /// diverging terminal status is *lease-conflict*, except `expired`, which
    /// means the reaper took the run back: *invalid-lease*. A `cancelling`
    /// attempt accepts only `cancelled`.
    pub async fn complete_attempt(
        &self,
        run_id: i64,
        lease_token_hash: &str,
        status: ResultStatus,
        exit_code: Option<i64>,
        error_message: Option<&str>,
    ) -> Result<(RunAttempt, Run)> {
        let now = now_ms();
        let mut tx = self.write.begin().await?;

        let attempt: Option<RunAttempt> = sqlx::query_as(
            "SELECT * FROM run_attempts
             WHERE run_id = ? AND lease_token_hash = ?
             ORDER BY attempt_no DESC LIMIT 1",
        )
        .bind(run_id)
        .bind(lease_token_hash)
        .fetch_optional(&mut *tx)
        .await?;
        let attempt = attempt.ok_or(StoreError::InvalidLease)?;

        let target = status.as_attempt_status();
        if attempt.status.is_terminal() {
            if attempt.status == target {
                let run: Run = sqlx::query_as("SELECT * FROM runs WHERE id = ?")
                    .bind(run_id)
                    .fetch_one(&mut *tx)
                    .await?;
                return Ok((attempt, run));
            }
            if attempt.status == AttemptStatus::Expired {
                return Err(StoreError::InvalidLease);
            }
            return Err(StoreError::LeaseConflict);
        }
        if attempt.status == AttemptStatus::Cancelling && status != ResultStatus::Cancelled {
            return Err(StoreError::LeaseConflict);
        }

        let flipped = sqlx::query(
            "UPDATE run_attempts
             SET status = ?, exit_code = ?, error_message = ?, finished_at = ?
             WHERE id = ? AND status IN ('leased', 'running', 'cancelling')",
        )
        .bind(target)
        .bind(exit_code)
        .bind(error_message)
        .bind(now)
        .bind(attempt.id)
        .execute(&mut *tx)
        .await?;
        if flipped.rows_affected() == 0 {
            return Err(StoreError::LeaseConflict);
        }

        sqlx::query(
            "UPDATE runs
             SET status = ?, finished_at = ?
             WHERE id = ? AND status IN ('queued', 'leased', 'running', 'cancelling')",
        )
        .bind(status.as_run_status())
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        let attempt: RunAttempt = sqlx::query_as("SELECT * FROM run_attempts WHERE id = ?")
            .bind(attempt.id)
            .fetch_one(&mut *tx)
            .await?;
        let run: Run = sqlx::query_as("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((attempt, run))
    }

    /// Resolve the run's version for the artifact endpoint, rejecting stale
    /// or mismatched leases.
    pub async fn artifact_context(
        &self,
        run_id: i64,
        lease_token_hash: &str,
    ) -> Result<(Run, AppVersion)> {
        let now = now_ms();
        let attempt: Option<RunAttempt> = sqlx::query_as(
            "SELECT * FROM run_attempts
             WHERE run_id = ? AND status IN ('leased', 'running', 'cancelling')",
        )
        .bind(run_id)
        .fetch_optional(&self.read)
        .await?;
        let attempt = match attempt {
            Some(a) if a.lease_token_hash == lease_token_hash && a.lease_expires_at > now => a,
            _ => return Err(StoreError::InvalidLease),
        };

        let run: Run = sqlx::query_as("SELECT * FROM runs WHERE id = ?")
            .bind(attempt.run_id)
            .fetch_one(&self.read)
            .await?;
        let version: AppVersion = sqlx::query_as("SELECT * FROM app_versions WHERE id = ?")
            .bind(run.version_id)
            .fetch_one(&self.read)
            .await?;
        Ok((run, version))
    }
}

/// The run's single non-terminal attempt, if any (unique by partial index).
async fn active_attempt(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    run_id: i64,
) -> Result<Option<RunAttempt>> {
    Ok(sqlx::query_as(
        "SELECT * FROM run_attempts
         WHERE run_id = ? AND status IN ('leased', 'running', 'cancelling')",
    )
    .bind(run_id)
    .fetch_optional(&mut **tx)
    .await?)
}
