//! Server lifecycle: listener, router, and the reaper background loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use minitower_store::Store;

use crate::artifacts::ArtifactStore;
use crate::config::ServerConfig;
use crate::routes::{build_router, AppState};

pub struct Server {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl Server {
    pub async fn start(
        store: Store,
        artifacts: ArtifactStore,
        cfg: ServerConfig,
        bind: SocketAddr,
        enable_reaper: bool,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind server to {bind}"))?;
        let addr = listener.local_addr().context("server local_addr")?;

        let state = Arc::new(AppState {
            store,
            artifacts,
            cfg,
        });
        let app = build_router(state.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_server(listener, app, state, shutdown_rx, enable_reaper));

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join server task")??;
        Ok(())
    }
}

async fn run_server(
    listener: TcpListener,
    app: Router,
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
    enable_reaper: bool,
) -> anyhow::Result<()> {
    let mut bg = Vec::<JoinHandle<anyhow::Result<()>>>::new();
    if enable_reaper {
        bg.push(tokio::spawn(reaper_loop(state.clone(), shutdown_rx.clone())));
    }

    let mut server_shutdown = shutdown_rx.clone();
    let server =
        axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        });

    tokio::select! {
        res = server => {
            res.context("serve")?;
        }
        _ = wait_shutdown(&mut shutdown_rx) => {}
    }

    for h in bg {
        let _ = h.await;
    }

    Ok(())
}

async fn wait_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn reaper_loop(
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let interval = Duration::from_millis(state.cfg.reaper_interval_ms);

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        match state
            .store
            .reap_once(state.cfg.reaper_batch, state.cfg.lease_ttl_ms)
            .await
        {
            Ok(outcome) => {
                if outcome != Default::default() {
                    tracing::info!(
                        retried = outcome.retried,
                        cancelled = outcome.cancelled,
                        dead = outcome.dead,
                        orphaned = outcome.orphaned,
                        runners_offline = outcome.runners_offline,
                        "reaper tick"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "reaper tick failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}
