//! Typed HTTP client for the runner protocol.
//!
//! Fencing responses (409 and 410) are part of the protocol, not transport
//! failures: they come back as [`Disposition::Stale`] so callers stop cleanly
//! instead of retrying.

use anyhow::Context;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;

use minitower_core::wire::{
    AppendLogsRequest, AttemptStateResponse, LeaseResponse, LogEntry, RegisterRequest,
    RegisterResponse, ResultRequest,
};
use minitower_core::LEASE_TOKEN_HEADER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition<T> {
    Ok(T),
    /// The control plane no longer recognizes this lease (409/410).
    Stale,
}

#[derive(Clone, Debug)]
pub struct ControlPlaneClient {
    base_url: String,
    runner_token: String,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(base_url: String, runner_token: String) -> Self {
        Self {
            base_url,
            runner_token,
            http: reqwest::Client::new(),
        }
    }

    /// One-time registration; the returned token is the runner's only
    /// credential and must be persisted by the caller.
    pub async fn register(
        base_url: &str,
        name: &str,
        environment: &str,
    ) -> anyhow::Result<RegisterResponse> {
        let url = join_url(base_url, "/runners/register")?;
        let resp = reqwest::Client::new()
            .post(url)
            .json(&RegisterRequest {
                name: name.to_string(),
                environment: environment.to_string(),
            })
            .send()
            .await
            .context("POST /runners/register")?;
        let resp = resp.error_for_status().context("register status")?;
        resp.json().await.context("decode register response")
    }

    pub async fn lease(&self) -> anyhow::Result<Option<LeaseResponse>> {
        let url = self.url("/runs/lease")?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.runner_token)
            .send()
            .await
            .context("POST /runs/lease")?;

        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let resp = resp.error_for_status().context("lease status")?;
        Ok(Some(resp.json().await.context("decode lease response")?))
    }

    pub async fn start(
        &self,
        run_id: i64,
        lease_token: &str,
    ) -> anyhow::Result<Disposition<AttemptStateResponse>> {
        self.attempt_call(run_id, "start", lease_token, None::<&()>)
            .await
    }

    pub async fn heartbeat(
        &self,
        run_id: i64,
        lease_token: &str,
    ) -> anyhow::Result<Disposition<AttemptStateResponse>> {
        self.attempt_call(run_id, "heartbeat", lease_token, None::<&()>)
            .await
    }

    pub async fn append_logs(
        &self,
        run_id: i64,
        lease_token: &str,
        logs: &[LogEntry],
    ) -> anyhow::Result<Disposition<()>> {
        let body = AppendLogsRequest {
            logs: logs.to_vec(),
        };
        let url = self.url(&format!("/runs/{run_id}/logs"))?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.runner_token)
            .header(LEASE_TOKEN_HEADER, lease_token)
            .json(&body)
            .send()
            .await
            .context("POST logs")?;

        if is_fence(resp.status()) {
            return Ok(Disposition::Stale);
        }
        resp.error_for_status().context("logs status")?;
        Ok(Disposition::Ok(()))
    }

    pub async fn submit_result(
        &self,
        run_id: i64,
        lease_token: &str,
        result: &ResultRequest,
    ) -> anyhow::Result<Disposition<AttemptStateResponse>> {
        self.attempt_call(run_id, "result", lease_token, Some(result))
            .await
    }

    async fn attempt_call<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        run_id: i64,
        op: &str,
        lease_token: &str,
        body: Option<&B>,
    ) -> anyhow::Result<Disposition<T>> {
        let url = self.url(&format!("/runs/{run_id}/{op}"))?;
        let mut req = self
            .http
            .post(url)
            .bearer_auth(&self.runner_token)
            .header(LEASE_TOKEN_HEADER, lease_token);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.with_context(|| format!("POST {op}"))?;

        if is_fence(resp.status()) {
            return Ok(Disposition::Stale);
        }
        let resp = resp
            .error_for_status()
            .with_context(|| format!("{op} status"))?;
        Ok(Disposition::Ok(
            resp.json().await.with_context(|| format!("decode {op}"))?,
        ))
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        join_url(&self.base_url, path)
    }
}

fn is_fence(status: StatusCode) -> bool {
    status == StatusCode::CONFLICT || status == StatusCode::GONE
}

fn join_url(base: &str, path: &str) -> anyhow::Result<Url> {
    let base = Url::parse(base).context("parse control plane base URL")?;
    base.join(path).context("join control plane URL")
}
