use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use minitower_runner::{Agent, AgentConfig, ControlPlaneClient, ProcessWorkload};

/// Runner agent configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "minitower-runner")]
#[command(about = "MiniTower self-hosted runner", long_about = None)]
struct RunnerCli {
    /// Control plane base URL.
    #[arg(long, env = "MINITOWER_URL", default_value = "http://127.0.0.1:8080")]
    control_plane_url: String,

    /// Globally unique runner name.
    #[arg(long, env = "MINITOWER_RUNNER_NAME")]
    name: String,

    /// Environment label this runner serves.
    #[arg(long, env = "MINITOWER_RUNNER_ENV", default_value = "default")]
    environment: String,

    /// File the runner token is persisted to across restarts.
    #[arg(long, env = "MINITOWER_RUNNER_TOKEN_FILE", default_value = ".minitower-runner-token")]
    token_file: PathBuf,

    /// Base poll interval in milliseconds (a bounded random jitter is added).
    #[arg(long, env = "MINITOWER_POLL_MS", default_value_t = 2_000)]
    poll_ms: u64,

    #[arg(long, env = "MINITOWER_POLL_JITTER_MS", default_value_t = 1_000)]
    poll_jitter_ms: u64,

    #[arg(long, env = "MINITOWER_LOG_FLUSH_MS", default_value_t = 500)]
    log_flush_ms: u64,

    /// Grace period between SIGTERM and SIGKILL when stopping a workload.
    #[arg(long, env = "MINITOWER_KILL_GRACE_MS", default_value_t = 5_000)]
    kill_grace_ms: u64,

    /// Local clock margin for the self-fence check.
    #[arg(long, env = "MINITOWER_CLOCK_SKEW_MS", default_value_t = 2_000)]
    clock_skew_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = RunnerCli::parse();
    let token = ensure_runner_token(&cli).await?;

    let client = ControlPlaneClient::new(cli.control_plane_url.clone(), token);
    let agent = Agent::new(
        client,
        AgentConfig {
            poll_interval: Duration::from_millis(cli.poll_ms),
            poll_jitter: Duration::from_millis(cli.poll_jitter_ms),
            log_flush_interval: Duration::from_millis(cli.log_flush_ms),
            clock_skew: Duration::from_millis(cli.clock_skew_ms),
        },
        Arc::new(ProcessWorkload::new(Duration::from_millis(cli.kill_grace_ms))),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!(
        name = %cli.name,
        environment = %cli.environment,
        control_plane = %cli.control_plane_url,
        "runner started"
    );
    agent.run(shutdown_rx).await
}

/// Reuse the persisted runner token, registering once if it is missing.
async fn ensure_runner_token(cli: &RunnerCli) -> anyhow::Result<String> {
    match tokio::fs::read_to_string(&cli.token_file).await {
        Ok(token) => {
            let token = token.trim().to_string();
            if !token.is_empty() {
                return Ok(token);
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read token file {}", cli.token_file.display()));
        }
    }

    let registered =
        ControlPlaneClient::register(&cli.control_plane_url, &cli.name, &cli.environment)
            .await
            .context("register runner")?;
    tokio::fs::write(&cli.token_file, format!("{}\n", registered.token))
        .await
        .with_context(|| format!("write token file {}", cli.token_file.display()))?;
    tracing::info!(runner_id = registered.runner_id, "runner registered");
    Ok(registered.token)
}
