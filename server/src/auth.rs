//! Request authentication.
//!
//! Two credentials: the bearer token identifies *who* is calling (team user
//! or registered runner); the `X-Lease-Token` header additionally identifies
//! *which attempt* a runner call acts on. Only token hashes ever reach the
//! store.

use axum::http::HeaderMap;
use minitower_core::{token, TokenRole, LEASE_TOKEN_HEADER};
use minitower_store::model::Runner;

use crate::error::ApiError;
use crate::routes::AppState;

/// A team-scoped caller resolved from an API token.
#[derive(Debug, Clone)]
pub struct TeamIdentity {
    pub team_id: i64,
    pub role: TokenRole,
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))
}

/// Resolve a team identity; a runner token on a team endpoint is a role
/// problem (403), an unknown token is 401.
pub async fn require_team(state: &AppState, headers: &HeaderMap) -> Result<TeamIdentity, ApiError> {
    let hash = token::hash(bearer_token(headers)?);
    if let Some(tok) = state.store.find_api_token(&hash).await? {
        return Ok(TeamIdentity {
            team_id: tok.team_id,
            role: tok.role,
        });
    }
    if state.store.find_runner_by_token(&hash).await?.is_some() {
        return Err(ApiError::forbidden("runner token not valid here"));
    }
    Err(ApiError::unauthorized("unknown token"))
}

/// Resolve a runner; a team token on a runner endpoint is 403, an unknown
/// token is 401.
pub async fn require_runner(state: &AppState, headers: &HeaderMap) -> Result<Runner, ApiError> {
    let hash = token::hash(bearer_token(headers)?);
    if let Some(runner) = state.store.find_runner_by_token(&hash).await? {
        return Ok(runner);
    }
    if state.store.find_api_token(&hash).await?.is_some() {
        return Err(ApiError::forbidden("team token not valid here"));
    }
    Err(ApiError::unauthorized("unknown token"))
}

/// Hash of the raw lease token carried by attempt-scoped calls.
pub fn lease_token_hash(headers: &HeaderMap) -> Result<String, ApiError> {
    let raw = headers
        .get(LEASE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::unauthorized("missing lease token"))?;
    Ok(token::hash(raw))
}
