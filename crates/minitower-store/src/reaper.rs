//! Expiry sweep.
//!
//! The reaper is the only path by which a non-terminal attempt whose lease
//! ran out becomes a retry, a dead run, or a cancellation; every other code
//! path may treat its own zero-row CAS as "someone else made progress". Each
//! expired attempt is resolved in its own transaction; an error on one is
//! logged and the next tick reconsiders it.

use minitower_core::{now_ms, RunStatus};

use crate::error::Result;
use crate::model::{Run, RunAttempt};
use crate::Store;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapOutcome {
    /// Attempts expired with the run requeued for another try.
    pub retried: u64,
    /// Attempts (and runs) resolved through the cancel branch.
    pub cancelled: u64,
    /// Attempts expired with the retry budget exhausted; run is dead.
    pub dead: u64,
    /// Attempts expired against a run that was already terminal.
    pub orphaned: u64,
    /// Runners newly marked offline.
    pub runners_offline: u64,
}

enum Branch {
    Retried,
    Cancelled,
    Dead,
    Orphaned,
    Skipped,
}

impl Store {
    /// One reaper tick: resolve up to `batch` expired attempts (oldest expiry
    /// first), then mark runners silent for more than `2 * lease_ttl_ms` as
    /// offline.
    pub async fn reap_once(&self, batch: i64, lease_ttl_ms: i64) -> Result<ReapOutcome> {
        let now = now_ms();
        let mut outcome = ReapOutcome::default();

        let expired: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT id, run_id FROM run_attempts
             WHERE status IN ('leased', 'running', 'cancelling') AND lease_expires_at <= ?
             ORDER BY lease_expires_at ASC
             LIMIT ?",
        )
        .bind(now)
        .bind(batch)
        .fetch_all(&self.read)
        .await?;

        for (attempt_id, run_id) in expired {
            match self.reap_attempt(attempt_id, now).await {
                Ok(Branch::Retried) => outcome.retried += 1,
                Ok(Branch::Cancelled) => outcome.cancelled += 1,
                Ok(Branch::Dead) => outcome.dead += 1,
                Ok(Branch::Orphaned) => outcome.orphaned += 1,
                Ok(Branch::Skipped) => {}
                Err(err) => {
                    tracing::warn!(error = %err, attempt_id, run_id, "reap attempt failed");
                }
            }
        }

        let offline = sqlx::query(
            "UPDATE runners SET status = 'offline' WHERE status = 'online' AND last_seen_at < ?",
        )
        .bind(now - 2 * lease_ttl_ms)
        .execute(&self.write)
        .await?;
        outcome.runners_offline = offline.rows_affected();

        Ok(outcome)
    }

    async fn reap_attempt(&self, attempt_id: i64, now: i64) -> Result<Branch> {
        let mut tx = self.write.begin().await?;

        let attempt: Option<RunAttempt> = sqlx::query_as(
            "SELECT * FROM run_attempts
             WHERE id = ? AND status IN ('leased', 'running', 'cancelling')
               AND lease_expires_at <= ?",
        )
        .bind(attempt_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(attempt) = attempt else {
            // Result or cancel landed between the scan and this transaction.
            return Ok(Branch::Skipped);
        };

        let run: Run = sqlx::query_as("SELECT * FROM runs WHERE id = ?")
            .bind(attempt.run_id)
            .fetch_one(&mut *tx)
            .await?;

        if run.cancel_requested || run.status == RunStatus::Cancelling {
            cancel_branch(&mut tx, attempt.id, run.id, now).await?;
            tx.commit().await?;
            return Ok(Branch::Cancelled);
        }

        if run.retry_count < run.max_retries {
            let requeued = sqlx::query(
                "UPDATE runs
                 SET status = 'queued', retry_count = retry_count + 1, queued_at = ?
                 WHERE id = ? AND status IN ('leased', 'running') AND cancel_requested = 0",
            )
            .bind(now)
            .bind(run.id)
            .execute(&mut *tx)
            .await?;
            if requeued.rows_affected() == 0 {
                let branch = resolve_raced_run(&mut tx, attempt.id, run.id, now).await?;
                tx.commit().await?;
                return Ok(branch);
            }
            expire_attempt(&mut tx, attempt.id, now).await?;
            tx.commit().await?;
            return Ok(Branch::Retried);
        }

        let died = sqlx::query(
            "UPDATE runs
             SET status = 'dead', finished_at = ?
             WHERE id = ? AND status IN ('leased', 'running') AND cancel_requested = 0",
        )
        .bind(now)
        .bind(run.id)
        .execute(&mut *tx)
        .await?;
        if died.rows_affected() == 0 {
            let branch = resolve_raced_run(&mut tx, attempt.id, run.id, now).await?;
            tx.commit().await?;
            return Ok(branch);
        }
        expire_attempt(&mut tx, attempt.id, now).await?;
        tx.commit().await?;
        Ok(Branch::Dead)
    }
}

/// The retry/dead CAS found zero rows: re-read and route. A pending cancel
/// wins; a run already terminal for another reason leaves only the attempt
/// marked expired.
async fn resolve_raced_run(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    attempt_id: i64,
    run_id: i64,
    now: i64,
) -> Result<Branch> {
    let run: Run = sqlx::query_as("SELECT * FROM runs WHERE id = ?")
        .bind(run_id)
        .fetch_one(&mut **tx)
        .await?;

    if run.cancel_requested || run.status == RunStatus::Cancelling {
        cancel_branch(tx, attempt_id, run_id, now).await?;
        return Ok(Branch::Cancelled);
    }

    expire_attempt(tx, attempt_id, now).await?;
    Ok(Branch::Orphaned)
}

async fn cancel_branch(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    attempt_id: i64,
    run_id: i64,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE run_attempts
         SET status = 'cancelled', finished_at = ?
         WHERE id = ? AND status IN ('leased', 'running', 'cancelling')",
    )
    .bind(now)
    .bind(attempt_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query(
        "UPDATE runs
         SET status = 'cancelled', finished_at = ?
         WHERE id = ? AND status IN ('queued', 'leased', 'running', 'cancelling')",
    )
    .bind(now)
    .bind(run_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn expire_attempt(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    attempt_id: i64,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE run_attempts
         SET status = 'expired', finished_at = ?
         WHERE id = ? AND status IN ('leased', 'running', 'cancelling')",
    )
    .bind(now)
    .bind(attempt_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
