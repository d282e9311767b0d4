//! HTTP surface of the orchestration core.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use minitower_core::wire::{AttemptStateResponse, RunResponse};
use minitower_store::model::{Run, RunAttempt};
use minitower_store::Store;

use crate::artifacts::ArtifactStore;
use crate::config::ServerConfig;

pub mod runner;
pub mod runs;

pub struct AppState {
    pub store: Store,
    pub artifacts: ArtifactStore,
    pub cfg: ServerConfig,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runners/register", post(runner::register))
        .route("/runs", post(runs::create))
        .route("/runs/lease", post(runner::lease))
        .route("/runs/:id", get(runs::get))
        .route("/runs/:id/start", post(runner::start))
        .route("/runs/:id/heartbeat", post(runner::heartbeat))
        .route("/runs/:id/logs", post(runner::append_logs).get(runs::logs))
        .route("/runs/:id/result", post(runner::result))
        .route("/runs/:id/artifact", get(runner::artifact))
        .route("/runs/:id/cancel", post(runs::cancel))
        .with_state(state)
}

pub(crate) fn run_body(run: &Run) -> RunResponse {
    RunResponse {
        id: run.id,
        app_id: run.app_id,
        run_no: run.run_no,
        status: run.status,
        priority: run.priority,
        max_retries: run.max_retries,
        retry_count: run.retry_count,
        cancel_requested: run.cancel_requested,
        queued_at: run.queued_at,
        started_at: run.started_at,
        finished_at: run.finished_at,
    }
}

pub(crate) fn attempt_body(attempt: &RunAttempt, run: &Run) -> AttemptStateResponse {
    AttemptStateResponse {
        attempt_id: attempt.id,
        attempt_no: attempt.attempt_no,
        status: attempt.status,
        lease_expires_at: attempt.lease_expires_at,
        cancel_requested: run.cancel_requested,
    }
}
