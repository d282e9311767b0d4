//! Shared contracts for the MiniTower orchestration core.
//!
//! This crate defines the cross-crate vocabulary used by the control plane and
//! the runner agent: run/attempt status sets, wire request/response bodies,
//! token minting and hashing, and the millisecond clock.
//!
//! # API notes
//! `minitower-core` is an internal crate (`publish = false`). Its public API
//! uses a few third-party types (`serde_json::Value`, `uuid::Uuid`) as part of
//! the MiniTower contract.

use chrono::Utc;

pub mod status;
pub mod token;
pub mod wire;

pub use status::{AttemptStatus, LogStream, ResultStatus, RunStatus, RunnerStatus, TokenRole};

/// Header carrying the raw per-attempt lease token on runner calls.
pub const LEASE_TOKEN_HEADER: &str = "x-lease-token";

/// Maximum number of log lines accepted in one append batch.
pub const MAX_LOG_BATCH: usize = 100;

/// Maximum byte length of a single log line.
pub const MAX_LOG_LINE_BYTES: usize = 8 * 1024;

/// Current control-plane time as integer epoch milliseconds.
///
/// All persisted timestamps and lease comparisons use this clock.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
