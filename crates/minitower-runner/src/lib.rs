//! MiniTower runner agent.
//!
//! Polls the control plane for leases, keeps them alive with heartbeats,
//! ships batched logs on a separate task, supervises the workload process,
//! and self-fences the moment it can no longer prove it owns the attempt.

pub mod agent;
pub mod client;
pub mod workload;

pub use agent::{Agent, AgentConfig};
pub use client::{ControlPlaneClient, Disposition};
pub use workload::{FakeWorkload, ProcessWorkload, Workload, WorkloadCtx, WorkloadOutcome};
