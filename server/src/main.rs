use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use minitower_server::artifacts::ArtifactStore;
use minitower_server::config::ServerConfig;
use minitower_server::server::Server;
use minitower_store::Store;

#[derive(Parser, Debug)]
#[command(name = "minitower-server")]
#[command(about = "MiniTower orchestration control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations and exit.
    Migrate,

    /// Run the control plane (HTTP server + reaper).
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = ServerConfig::from_env().context("load server config")?;

    let store = Store::open(&cfg.database_path)
        .await
        .with_context(|| format!("open database {}", cfg.database_path.display()))?;

    match cli.command {
        Command::Migrate => {
            store.migrate().await.context("run migrations")?;
            tracing::info!("migrations complete");
            Ok(())
        }
        Command::Serve => {
            store.migrate().await.context("run migrations")?;

            let bind = cfg
                .bind
                .parse()
                .with_context(|| format!("parse MINITOWER_BIND={}", cfg.bind))?;
            let artifacts = ArtifactStore::new(&cfg.artifact_dir);

            let server = Server::start(store, artifacts, cfg, bind, true).await?;
            tracing::info!(addr = %server.addr, "control plane listening");

            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            tracing::info!("shutting down");
            server.shutdown().await
        }
    }
}
