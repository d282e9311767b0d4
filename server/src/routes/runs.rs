//! Team-facing run lifecycle: create, read, logs, cancel.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use minitower_core::wire::{CreateRunRequest, LogLine, LogsResponse, RunResponse};
use minitower_store::runs::NewRun;

use crate::auth::require_team;
use crate::error::ApiResult;
use crate::routes::{run_body, AppState};

pub async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRunRequest>,
) -> ApiResult<(StatusCode, Json<RunResponse>)> {
    let identity = require_team(&state, &headers).await?;

    let run = state
        .store
        .create_run(NewRun {
            team_id: identity.team_id,
            app_slug: &req.app,
            environment: req.environment.as_deref().unwrap_or("default"),
            version: req.version,
            input: req.input,
            priority: req.priority.unwrap_or(0),
            max_retries: req.max_retries.unwrap_or(0),
        })
        .await?;

    tracing::info!(
        run_id = run.id,
        app_id = run.app_id,
        run_no = run.run_no,
        "run created"
    );
    Ok((StatusCode::CREATED, Json(run_body(&run))))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<RunResponse>> {
    let identity = require_team(&state, &headers).await?;
    let run = state.store.get_run(identity.team_id, run_id).await?;
    Ok(Json(run_body(&run)))
}

pub async fn logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<LogsResponse>> {
    let identity = require_team(&state, &headers).await?;
    // Scope check before touching the log table.
    let run = state.store.get_run(identity.team_id, run_id).await?;

    let lines = state.store.list_logs(run.id).await?;
    Ok(Json(LogsResponse {
        logs: lines
            .into_iter()
            .map(|l| LogLine {
                attempt_no: l.attempt_no,
                seq: l.seq,
                stream: l.stream,
                line: l.line,
                logged_at: l.logged_at,
            })
            .collect(),
    }))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<RunResponse>> {
    let identity = require_team(&state, &headers).await?;
    let run = state.store.cancel_run(identity.team_id, run_id).await?;
    tracing::info!(run_id = run.id, status = ?run.status, "cancel requested");
    Ok(Json(run_body(&run)))
}
