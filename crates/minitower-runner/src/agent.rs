//! The agent loop.
//!
//! One iteration: poll for a lease with jitter, ack start, keep the lease
//! alive from a dedicated heartbeat task, ship logs from a dedicated flush
//! task (log backpressure must never delay heartbeats), supervise the
//! workload, and submit exactly one result (or none at all after a fence).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use minitower_core::wire::{LeaseResponse, LogEntry, ResultRequest};
use minitower_core::{now_ms, LogStream, ResultStatus, MAX_LOG_BATCH, MAX_LOG_LINE_BYTES};

use crate::client::{ControlPlaneClient, Disposition};
use crate::workload::{Workload, WorkloadCtx, WorkloadOutcome};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub poll_interval: Duration,
    pub poll_jitter: Duration,
    pub log_flush_interval: Duration,
    /// Local safety margin subtracted from the lease expiry when deciding to
    /// self-fence without waiting for the control plane to say so.
    pub clock_skew: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            poll_jitter: Duration::from_secs(1),
            log_flush_interval: Duration::from_millis(500),
            clock_skew: Duration::from_secs(2),
        }
    }
}

/// Control-plane-observed events that end or redirect an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    None,
    /// The user asked for cancellation; stop the workload, submit `cancelled`.
    Cancel,
    /// The lease is no longer ours; stop the workload, submit nothing.
    Fence,
}

enum Ending {
    Cancelled,
    Fenced,
    TimedOut,
}

pub struct Agent {
    client: ControlPlaneClient,
    cfg: AgentConfig,
    workload: Arc<dyn Workload>,
}

impl Agent {
    pub fn new(client: ControlPlaneClient, cfg: AgentConfig, workload: Arc<dyn Workload>) -> Self {
        Self {
            client,
            cfg,
            workload,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.client.lease().await {
                Ok(Some(lease)) => {
                    if let Err(err) = self.execute_lease(&lease).await {
                        tracing::warn!(error = %err, run_id = lease.run_id, "attempt failed");
                    }
                }
                Ok(None) => {
                    self.idle_sleep(&mut shutdown).await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "lease poll failed");
                    self.idle_sleep(&mut shutdown).await;
                }
            }
        }
    }

    async fn idle_sleep(&self, shutdown: &mut watch::Receiver<bool>) {
        let jitter_ms = self.cfg.poll_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        tokio::select! {
            _ = tokio::time::sleep(self.cfg.poll_interval + jitter) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn execute_lease(&self, lease: &LeaseResponse) -> anyhow::Result<()> {
        let run_id = lease.run_id;
        tracing::info!(run_id, attempt_no = lease.attempt_no, "lease acquired");

        // Ack start before any setup; the heartbeat task spawns right after
        // so the lease survives workspace preparation.
        let started = match self.client.start(run_id, &lease.lease_token).await? {
            Disposition::Ok(state) => state,
            Disposition::Stale => {
                tracing::warn!(run_id, "fenced before start; dropping attempt");
                return Ok(());
            }
        };

        let lease_expiry = Arc::new(AtomicI64::new(started.lease_expires_at));
        let (signal_tx, mut signal_rx) = watch::channel(Signal::None);
        if started.cancel_requested {
            let _ = signal_tx.send(Signal::Cancel);
        }

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.client.clone(),
            run_id,
            lease.lease_token.clone(),
            lease_expiry.clone(),
            signal_tx.clone(),
            self.cfg.clock_skew,
        ));

        let (log_tx, log_rx) = mpsc::channel::<(LogStream, String)>(1024);
        let flusher = tokio::spawn(log_flush_loop(
            self.client.clone(),
            run_id,
            lease.lease_token.clone(),
            log_rx,
            self.cfg.log_flush_interval,
        ));

        // Preparation failures still owe the control plane a result.
        let workspace = match tempfile::tempdir().context("create attempt workspace") {
            Ok(workspace) => workspace,
            Err(err) => {
                heartbeat.abort();
                flusher.abort();
                let result = ResultRequest {
                    status: ResultStatus::Failed,
                    exit_code: None,
                    error_message: Some(format!("{err:#}")),
                };
                let _ = self
                    .client
                    .submit_result(run_id, &lease.lease_token, &result)
                    .await;
                return Err(err);
            }
        };
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut work = Box::pin(self.workload.execute(WorkloadCtx {
            run_id,
            entrypoint: lease.entrypoint.clone(),
            input: lease.input.clone(),
            workspace: workspace.path().to_path_buf(),
            logs: log_tx.clone(),
            stop: stop_rx,
        }));

        let timeout_at = lease
            .timeout_seconds
            .map(|secs| Instant::now() + Duration::from_secs(secs.max(0) as u64));
        let far_future = Instant::now() + Duration::from_secs(86_400);

        let mut ending: Option<Ending> = None;
        let outcome = loop {
            tokio::select! {
                res = &mut work => break res,
                changed = signal_rx.changed(), if ending.is_none() => {
                    if changed.is_err() {
                        continue;
                    }
                    match *signal_rx.borrow() {
                        Signal::Cancel => {
                            tracing::info!(run_id, "cancel observed");
                            ending = Some(Ending::Cancelled);
                            let _ = stop_tx.send(true);
                        }
                        Signal::Fence => {
                            tracing::warn!(run_id, "lease fenced mid-run");
                            ending = Some(Ending::Fenced);
                            let _ = stop_tx.send(true);
                        }
                        Signal::None => {}
                    }
                }
                _ = tokio::time::sleep_until(timeout_at.unwrap_or(far_future)),
                        if ending.is_none() && timeout_at.is_some() => {
                    tracing::warn!(run_id, "workload timed out");
                    ending = Some(Ending::TimedOut);
                    let _ = stop_tx.send(true);
                }
            }
        };

        // The finished future still holds its log sender; both must go so the
        // flusher can drain to completion.
        drop(work);
        heartbeat.abort();
        drop(log_tx);

        if matches!(ending, Some(Ending::Fenced)) {
            // Self-fence: stop reporting entirely. The reaper owns the run now.
            flusher.abort();
            return Ok(());
        }

        // Drain remaining logs before the result makes the attempt terminal.
        let _ = flusher.await;

        let result = match (&ending, outcome) {
            (Some(Ending::Cancelled), _) => ResultRequest {
                status: ResultStatus::Cancelled,
                exit_code: None,
                error_message: None,
            },
            (Some(Ending::TimedOut), _) => ResultRequest {
                status: ResultStatus::Failed,
                exit_code: None,
                error_message: Some("timeout".to_string()),
            },
            (Some(Ending::Fenced), _) => unreachable!("fence returns above"),
            (None, Ok(WorkloadOutcome {
                success: true,
                exit_code,
                ..
            })) => ResultRequest {
                status: ResultStatus::Completed,
                exit_code,
                error_message: None,
            },
            (None, Ok(outcome)) => ResultRequest {
                status: ResultStatus::Failed,
                exit_code: outcome.exit_code,
                error_message: outcome.error,
            },
            (None, Err(err)) => ResultRequest {
                status: ResultStatus::Failed,
                exit_code: None,
                error_message: Some(format!("{err:#}")),
            },
        };

        match self
            .client
            .submit_result(run_id, &lease.lease_token, &result)
            .await?
        {
            Disposition::Ok(state) => {
                tracing::info!(run_id, status = ?state.status, "result submitted");
            }
            Disposition::Stale => {
                tracing::warn!(run_id, "result rejected; lease no longer ours");
            }
        }
        Ok(())
    }
}

/// True once the local clock can no longer prove the lease is alive.
fn lease_is_stale(now_ms: i64, lease_expires_at: i64, skew: Duration) -> bool {
    now_ms >= lease_expires_at - skew.as_millis() as i64
}

async fn heartbeat_loop(
    client: ControlPlaneClient,
    run_id: i64,
    lease_token: String,
    lease_expiry: Arc<AtomicI64>,
    signal_tx: watch::Sender<Signal>,
    clock_skew: Duration,
) {
    loop {
        let expires_at = lease_expiry.load(Ordering::Relaxed);
        let ttl_ms = (expires_at - now_ms()).max(0);
        let interval = Duration::from_millis((ttl_ms as u64 / 3).clamp(100, 20_000));
        tokio::time::sleep(interval).await;

        if lease_is_stale(now_ms(), lease_expiry.load(Ordering::Relaxed), clock_skew) {
            let _ = signal_tx.send(Signal::Fence);
            return;
        }

        match client.heartbeat(run_id, &lease_token).await {
            Ok(Disposition::Ok(state)) => {
                lease_expiry.store(state.lease_expires_at, Ordering::Relaxed);
                if state.cancel_requested && *signal_tx.borrow() == Signal::None {
                    let _ = signal_tx.send(Signal::Cancel);
                }
            }
            Ok(Disposition::Stale) => {
                let _ = signal_tx.send(Signal::Fence);
                return;
            }
            Err(err) => {
                // Transient transport failure; the next tick retries and the
                // local staleness check above bounds how long we keep going.
                tracing::warn!(error = %err, run_id, "heartbeat failed");
            }
        }
    }
}

async fn log_flush_loop(
    client: ControlPlaneClient,
    run_id: i64,
    lease_token: String,
    mut rx: mpsc::Receiver<(LogStream, String)>,
    flush_interval: Duration,
) {
    let mut seq: i64 = 1;
    let mut batch: Vec<LogEntry> = Vec::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some((stream, line)) => {
                    batch.push(make_entry(seq, stream, line));
                    seq += 1;
                    if batch.len() >= MAX_LOG_BATCH
                        && !flush(&client, run_id, &lease_token, &mut batch).await
                    {
                        return;
                    }
                }
                None => {
                    flush(&client, run_id, &lease_token, &mut batch).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() && !flush(&client, run_id, &lease_token, &mut batch).await {
                    return;
                }
            }
        }
    }
}

fn make_entry(seq: i64, stream: LogStream, mut line: String) -> LogEntry {
    if line.len() > MAX_LOG_LINE_BYTES {
        let mut end = MAX_LOG_LINE_BYTES;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        line.truncate(end);
    }
    LogEntry {
        seq,
        stream,
        line,
        logged_at: Some(now_ms()),
    }
}

/// Ship the batch; `false` means the lease is stale and shipping must stop.
/// Transport errors keep the batch for the next tick.
async fn flush(
    client: &ControlPlaneClient,
    run_id: i64,
    lease_token: &str,
    batch: &mut Vec<LogEntry>,
) -> bool {
    if batch.is_empty() {
        return true;
    }
    match client.append_logs(run_id, lease_token, batch).await {
        Ok(Disposition::Ok(())) => {
            batch.clear();
            true
        }
        Ok(Disposition::Stale) => false,
        Err(err) => {
            tracing::warn!(error = %err, run_id, "log flush failed; retrying next tick");
            true
        }
    }
}
