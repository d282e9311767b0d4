//! MiniTower control plane.
//!
//! Hosts the orchestration core over HTTP: run lifecycle handlers, the
//! lease-guarded runner protocol, artifact streaming, and the reaper loop.

pub mod artifacts;
pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod server;
