use clap::Parser;
use std::path::PathBuf;

/// Control plane configuration.
///
/// Parsed once at startup from flags or environment; passed by reference
/// everywhere else.
#[derive(Parser, Debug, Clone)]
pub struct ServerConfig {
    /// Path of the SQLite database file.
    #[arg(long, env = "MINITOWER_DB", default_value = "minitower.db")]
    pub database_path: PathBuf,

    /// Bind address for the HTTP listener.
    #[arg(long, env = "MINITOWER_BIND", default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Root directory of the artifact object store.
    #[arg(long, env = "MINITOWER_ARTIFACT_DIR", default_value = "artifacts")]
    pub artifact_dir: PathBuf,

    /// Lease TTL handed to runners, in milliseconds.
    #[arg(long, env = "MINITOWER_LEASE_TTL_MS", default_value_t = 60_000)]
    pub lease_ttl_ms: i64,

    /// Reaper sweep interval in milliseconds.
    #[arg(long, env = "MINITOWER_REAPER_INTERVAL_MS", default_value_t = 10_000)]
    pub reaper_interval_ms: u64,

    /// Maximum expired attempts resolved per reaper tick.
    #[arg(long, env = "MINITOWER_REAPER_BATCH", default_value_t = 100)]
    pub reaper_batch: i64,
}

impl ServerConfig {
    /// Parse config from environment only (no CLI arguments).
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::parse_from(["minitower-server"]))
    }
}
