//! Workload execution behind a trait seam.
//!
//! The agent owns timing, fencing, and result submission; a [`Workload`] only
//! turns an entrypoint plus input into log lines and an outcome, honoring the
//! cooperative stop signal. [`ProcessWorkload`] is the real implementation;
//! [`FakeWorkload`] scripts behavior for tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use minitower_core::LogStream;

/// Everything a workload gets for one attempt. The workspace directory is
/// owned exclusively by this attempt and removed afterwards.
pub struct WorkloadCtx {
    pub run_id: i64,
    pub entrypoint: String,
    pub input: Option<Value>,
    pub workspace: PathBuf,
    pub logs: mpsc::Sender<(LogStream, String)>,
    /// Flips to `true` when the agent wants the workload stopped (cancel,
    /// timeout, or fence).
    pub stop: watch::Receiver<bool>,
}

#[derive(Debug, Clone)]
pub struct WorkloadOutcome {
    pub success: bool,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

impl WorkloadOutcome {
    pub fn success(exit_code: i64) -> Self {
        Self {
            success: true,
            exit_code: Some(exit_code),
            error: None,
        }
    }

    pub fn failed(exit_code: Option<i64>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait Workload: Send + Sync {
    async fn execute(&self, ctx: WorkloadCtx) -> anyhow::Result<WorkloadOutcome>;
}

/// Runs the entrypoint as a child process via `sh -c`, piping stdout/stderr
/// into the log channel. Stop requests deliver SIGTERM, then SIGKILL once the
/// grace period runs out.
pub struct ProcessWorkload {
    kill_grace: Duration,
}

impl ProcessWorkload {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

#[async_trait]
impl Workload for ProcessWorkload {
    async fn execute(&self, ctx: WorkloadCtx) -> anyhow::Result<WorkloadOutcome> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&ctx.entrypoint)
            .current_dir(&ctx.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().context("spawn workload process")?;

        let mut stdin = child.stdin.take().context("take stdin")?;
        let input_bytes = match &ctx.input {
            Some(v) => serde_json::to_vec(v).context("encode input json")?,
            None => b"null".to_vec(),
        };
        stdin
            .write_all(&input_bytes)
            .await
            .context("write input to stdin")?;
        stdin.shutdown().await.context("close stdin")?;
        drop(stdin);

        let stdout = child.stdout.take().context("take stdout")?;
        let stderr = child.stderr.take().context("take stderr")?;
        let out_pump = tokio::spawn(pump_lines(stdout, LogStream::Stdout, ctx.logs.clone()));
        let err_pump = tokio::spawn(pump_lines(stderr, LogStream::Stderr, ctx.logs.clone()));

        let status = supervise(&mut child, ctx.stop.clone(), self.kill_grace).await?;

        let _ = out_pump.await;
        let _ = err_pump.await;

        if status.success() {
            Ok(WorkloadOutcome::success(0))
        } else {
            let code = status.code().map(i64::from);
            Ok(WorkloadOutcome::failed(
                code,
                format!("process exited with {status}"),
            ))
        }
    }
}

/// Wait for the child, delivering SIGTERM when stop flips and SIGKILL after
/// the grace period.
async fn supervise(
    child: &mut Child,
    mut stop: watch::Receiver<bool>,
    kill_grace: Duration,
) -> anyhow::Result<std::process::ExitStatus> {
    let far_future = || Instant::now() + Duration::from_secs(86_400);
    let mut term_sent = false;
    let mut kill_at = far_future();
    if *stop.borrow() {
        send_sigterm(child);
        term_sent = true;
        kill_at = Instant::now() + kill_grace;
    }

    loop {
        tokio::select! {
            status = child.wait() => {
                return status.context("wait workload process");
            }
            res = stop.changed(), if !term_sent => {
                if res.is_err() || *stop.borrow() {
                    send_sigterm(child);
                    term_sent = true;
                    kill_at = Instant::now() + kill_grace;
                }
            }
            _ = tokio::time::sleep_until(kill_at), if term_sent => {
                let _ = child.start_kill();
                kill_at = far_future();
            }
        }
    }
}

fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(
    reader: R,
    stream: LogStream,
    logs: mpsc::Sender<(LogStream, String)>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if logs.send((stream, line)).await.is_err() {
            return;
        }
    }
}

/// Scripted workload for agent tests: emits fixed lines, optionally waits for
/// the stop signal, then returns a fixed outcome.
#[derive(Clone)]
pub struct FakeWorkload {
    pub lines: Vec<(LogStream, String)>,
    pub outcome: WorkloadOutcome,
    pub wait_for_stop: bool,
    pub delay: Duration,
}

impl FakeWorkload {
    pub fn succeeding(lines: Vec<(LogStream, String)>) -> Self {
        Self {
            lines,
            outcome: WorkloadOutcome::success(0),
            wait_for_stop: false,
            delay: Duration::from_millis(0),
        }
    }
}

#[async_trait]
impl Workload for FakeWorkload {
    async fn execute(&self, ctx: WorkloadCtx) -> anyhow::Result<WorkloadOutcome> {
        for (stream, line) in &self.lines {
            let _ = ctx.logs.send((*stream, line.clone())).await;
        }
        if self.delay > Duration::from_millis(0) {
            tokio::time::sleep(self.delay).await;
        }
        if self.wait_for_stop {
            let mut stop = ctx.stop.clone();
            while !*stop.borrow() {
                if stop.changed().await.is_err() {
                    break;
                }
            }
        }
        Ok(self.outcome.clone())
    }
}
