//! Runner protocol: register, lease, start, heartbeat, logs, result, artifact.
//!
//! Every attempt-scoped endpoint takes two credentials: the runner's bearer
//! token and the raw lease token minted at claim time. Store errors carry the
//! HTTP mapping; handlers never retry.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use minitower_core::wire::{
    AppendLogsRequest, AppendLogsResponse, AttemptStateResponse, LeaseResponse, RegisterRequest,
    RegisterResponse, ResultRequest,
};
use minitower_core::{token, MAX_LOG_BATCH, MAX_LOG_LINE_BYTES};
use minitower_store::StoreError;

use crate::auth::{lease_token_hash, require_runner};
use crate::error::{ApiError, ApiResult};
use crate::routes::{attempt_body, AppState};

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let raw = token::mint();
    let runner = state
        .store
        .register_runner(&req.name, &req.environment, &token::hash(&raw))
        .await?;

    tracing::info!(
        runner_id = runner.id,
        name = %runner.name,
        environment = %runner.environment,
        "runner registered"
    );
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            runner_id: runner.id,
            name: runner.name,
            token: raw,
        }),
    ))
}

pub async fn lease(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Response> {
    let runner = require_runner(&state, &headers).await?;

    let raw = token::mint();
    let leased = match state
        .store
        .lease_run(runner.id, &token::hash(&raw), state.cfg.lease_ttl_ms)
        .await
    {
        Ok(leased) => leased,
        Err(StoreError::NoWork) => return Ok(StatusCode::NO_CONTENT.into_response()),
        Err(err) => return Err(err.into()),
    };

    tracing::info!(
        run_id = leased.run.id,
        attempt_no = leased.attempt.attempt_no,
        runner_id = runner.id,
        "run leased"
    );
    Ok(Json(LeaseResponse {
        run_id: leased.run.id,
        attempt_id: leased.attempt.id,
        attempt_no: leased.attempt.attempt_no,
        lease_token: raw,
        lease_expires_at: leased.attempt.lease_expires_at,
        input: leased.run.input.map(|j| j.0),
        entrypoint: leased.version.entrypoint,
        timeout_seconds: leased.version.timeout_seconds,
        artifact_sha256: leased.version.artifact_sha256,
    })
    .into_response())
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<AttemptStateResponse>> {
    require_runner(&state, &headers).await?;
    let lease_hash = lease_token_hash(&headers)?;

    let (attempt, run) = state.store.start_attempt(run_id, &lease_hash).await?;
    Ok(Json(attempt_body(&attempt, &run)))
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<AttemptStateResponse>> {
    require_runner(&state, &headers).await?;
    let lease_hash = lease_token_hash(&headers)?;

    let (attempt, run) = state
        .store
        .extend_lease(run_id, &lease_hash, state.cfg.lease_ttl_ms)
        .await?;
    Ok(Json(attempt_body(&attempt, &run)))
}

pub async fn append_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<i64>,
    Json(req): Json<AppendLogsRequest>,
) -> ApiResult<Json<AppendLogsResponse>> {
    require_runner(&state, &headers).await?;
    let lease_hash = lease_token_hash(&headers)?;

    if req.logs.len() > MAX_LOG_BATCH {
        return Err(ApiError::payload_too_large(format!(
            "log batch exceeds {MAX_LOG_BATCH} lines"
        )));
    }
    if let Some(entry) = req.logs.iter().find(|e| e.line.len() > MAX_LOG_LINE_BYTES) {
        return Err(ApiError::payload_too_large(format!(
            "log line seq={} exceeds {MAX_LOG_LINE_BYTES} bytes",
            entry.seq
        )));
    }

    let accepted = state.store.append_logs(run_id, &lease_hash, &req.logs).await?;
    Ok(Json(AppendLogsResponse { accepted }))
}

pub async fn result(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<i64>,
    Json(req): Json<ResultRequest>,
) -> ApiResult<Json<AttemptStateResponse>> {
    require_runner(&state, &headers).await?;
    let lease_hash = lease_token_hash(&headers)?;

    let (attempt, run) = state
        .store
        .complete_attempt(
            run_id,
            &lease_hash,
            req.status,
            req.exit_code,
            req.error_message.as_deref(),
        )
        .await?;

    tracing::info!(
        run_id = run.id,
        attempt_no = attempt.attempt_no,
        status = ?attempt.status,
        "result recorded"
    );
    Ok(Json(attempt_body(&attempt, &run)))
}

/// Stream the tar.gz bound to the run's version. Stale leases are rejected,
/// so a fenced runner cannot keep downloading.
pub async fn artifact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<i64>,
) -> ApiResult<Response> {
    require_runner(&state, &headers).await?;
    let lease_hash = lease_token_hash(&headers)?;

    let (_run, version) = state.store.artifact_context(run_id, &lease_hash).await?;
    let bytes = state
        .artifacts
        .get(&version.artifact_key)
        .await
        .map_err(ApiError::internal)?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/gzip"),
    );
    response_headers.insert(
        "x-artifact-sha256",
        HeaderValue::from_str(&version.artifact_sha256).map_err(ApiError::internal)?,
    );
    response_headers.insert(
        "x-entrypoint",
        HeaderValue::from_str(&version.entrypoint).map_err(ApiError::internal)?,
    );
    if let Some(timeout) = version.timeout_seconds {
        response_headers.insert(
            "x-timeout-seconds",
            HeaderValue::from_str(&timeout.to_string()).map_err(ApiError::internal)?,
        );
    }

    Ok((response_headers, bytes).into_response())
}
