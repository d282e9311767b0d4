//! End-to-end orchestration invariants over HTTP: the double-lease race,
//! fencing, retry and death via the reaper, cancellation convergence, log
//! dedupe, and the auth matrix.

use anyhow::Context;
use minitower_core::{token, TokenRole, LEASE_TOKEN_HEADER};
use minitower_server::artifacts::{sha256_hex, ArtifactStore};
use minitower_server::config::ServerConfig;
use minitower_server::server::Server;
use minitower_store::tenancy::NewVersion;
use minitower_store::Store;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;

const ARTIFACT_BYTES: &[u8] = b"pretend-this-is-a-tar-gz";

struct Harness {
    _tmp: TempDir,
    server: Server,
    base: String,
    http: reqwest::Client,
    store: Store,
    team_id: i64,
    user_token: String,
    db_path: std::path::PathBuf,
}

async fn start_harness(lease_ttl_ms: i64, reaper_interval_ms: u64, enable_reaper: bool) -> anyhow::Result<Harness> {
    let tmp = tempfile::tempdir().context("create temp dir")?;
    let db_path = tmp.path().join("state.db");
    let artifact_dir = tmp.path().join("artifacts");

    let store = Store::open(&db_path).await?;
    store.migrate().await?;

    let team = store.create_team("acme").await?;
    let app = store.create_app(team.id, "hello-world").await?;

    let artifacts = ArtifactStore::new(&artifact_dir);
    let key = ArtifactStore::object_key(app.id);
    artifacts.put(&key, ARTIFACT_BYTES).await?;
    store
        .publish_version(
            app.id,
            NewVersion {
                entrypoint: "python main.py",
                timeout_seconds: Some(300),
                input_schema: None,
                artifact_key: &key,
                artifact_sha256: &sha256_hex(ARTIFACT_BYTES),
            },
        )
        .await?;

    let user_token = token::mint();
    store
        .issue_api_token(team.id, TokenRole::User, &token::hash(&user_token))
        .await?;

    let cfg = ServerConfig {
        database_path: db_path.clone(),
        bind: "127.0.0.1:0".to_string(),
        artifact_dir: artifact_dir.clone(),
        lease_ttl_ms,
        reaper_interval_ms,
        reaper_batch: 50,
    };

    let server = Server::start(
        store.clone(),
        ArtifactStore::new(&artifact_dir),
        cfg,
        "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
        enable_reaper,
    )
    .await?;
    let base = format!("http://{}", server.addr);

    Ok(Harness {
        _tmp: tmp,
        server,
        base,
        http: reqwest::Client::new(),
        store,
        team_id: team.id,
        user_token,
        db_path,
    })
}

impl Harness {
    async fn register_runner(&self, name: &str) -> anyhow::Result<String> {
        let resp = self
            .http
            .post(format!("{}/runners/register", self.base))
            .json(&json!({"name": name, "environment": "default"}))
            .send()
            .await?;
        anyhow::ensure!(resp.status() == 201, "register got {}", resp.status());
        let body: Value = resp.json().await?;
        Ok(body["token"].as_str().context("token")?.to_string())
    }

    async fn create_run(&self, body: Value) -> anyhow::Result<Value> {
        let resp = self
            .http
            .post(format!("{}/runs", self.base))
            .bearer_auth(&self.user_token)
            .json(&body)
            .send()
            .await?;
        anyhow::ensure!(resp.status() == 201, "create run got {}", resp.status());
        Ok(resp.json().await?)
    }

    async fn lease(&self, runner_token: &str) -> anyhow::Result<reqwest::Response> {
        Ok(self
            .http
            .post(format!("{}/runs/lease", self.base))
            .bearer_auth(runner_token)
            .send()
            .await?)
    }

    async fn lease_ok(&self, runner_token: &str) -> anyhow::Result<Value> {
        let resp = self.lease(runner_token).await?;
        anyhow::ensure!(resp.status() == 200, "lease got {}", resp.status());
        Ok(resp.json().await?)
    }

    async fn attempt_call(
        &self,
        runner_token: &str,
        lease_token: &str,
        run_id: i64,
        op: &str,
        body: Option<Value>,
    ) -> anyhow::Result<reqwest::Response> {
        let mut req = self
            .http
            .post(format!("{}/runs/{run_id}/{op}", self.base))
            .bearer_auth(runner_token)
            .header(LEASE_TOKEN_HEADER, lease_token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        Ok(req.send().await?)
    }

    async fn get_run(&self, run_id: i64) -> anyhow::Result<Value> {
        let resp = self
            .http
            .get(format!("{}/runs/{run_id}", self.base))
            .bearer_auth(&self.user_token)
            .send()
            .await?;
        anyhow::ensure!(resp.status() == 200, "get run got {}", resp.status());
        Ok(resp.json().await?)
    }

    async fn wait_for_status(&self, run_id: i64, expected: &str) -> anyhow::Result<Value> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let run = self.get_run(run_id).await?;
            if run["status"] == expected {
                return Ok(run);
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for status {expected}, last: {run}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[tokio::test]
async fn happy_path_runs_to_completion() -> anyhow::Result<()> {
    let h = start_harness(60_000, 10_000, false).await?;
    let runner_token = h.register_runner("worker-a").await?;
    let run = h.create_run(json!({"app": "hello-world"})).await?;
    let run_id = run["id"].as_i64().context("run id")?;
    anyhow::ensure!(run["status"] == "queued" && run["run_no"] == 1);

    let lease = h.lease_ok(&runner_token).await?;
    anyhow::ensure!(lease["run_id"].as_i64() == Some(run_id));
    anyhow::ensure!(lease["attempt_no"] == 1);
    anyhow::ensure!(lease["entrypoint"] == "python main.py");
    let lt = lease["lease_token"].as_str().context("lease token")?;

    let start = h.attempt_call(&runner_token, lt, run_id, "start", None).await?;
    anyhow::ensure!(start.status() == 200, "start got {}", start.status());
    let start: Value = start.json().await?;
    anyhow::ensure!(start["status"] == "running");
    anyhow::ensure!(start["cancel_requested"] == false);

    let mut last_expiry = start["lease_expires_at"].as_i64().context("expiry")?;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let hb = h
            .attempt_call(&runner_token, lt, run_id, "heartbeat", None)
            .await?;
        anyhow::ensure!(hb.status() == 200);
        let hb: Value = hb.json().await?;
        let expiry = hb["lease_expires_at"].as_i64().context("expiry")?;
        anyhow::ensure!(expiry >= last_expiry, "heartbeat must advance the lease");
        last_expiry = expiry;
    }

    let logs = h
        .attempt_call(
            &runner_token,
            lt,
            run_id,
            "logs",
            Some(json!({"logs": [
                {"seq": 1, "stream": "stdout", "line": "one"},
                {"seq": 2, "stream": "stdout", "line": "two"},
                {"seq": 3, "stream": "stderr", "line": "three"},
            ]})),
        )
        .await?;
    anyhow::ensure!(logs.status() == 200);
    let logs = h
        .attempt_call(
            &runner_token,
            lt,
            run_id,
            "logs",
            Some(json!({"logs": [
                {"seq": 4, "stream": "stdout", "line": "four"},
                {"seq": 5, "stream": "stdout", "line": "five"},
            ]})),
        )
        .await?;
    anyhow::ensure!(logs.status() == 200);

    let result = h
        .attempt_call(
            &runner_token,
            lt,
            run_id,
            "result",
            Some(json!({"status": "completed", "exit_code": 0})),
        )
        .await?;
    anyhow::ensure!(result.status() == 200, "result got {}", result.status());

    let run = h.get_run(run_id).await?;
    anyhow::ensure!(run["status"] == "completed");
    anyhow::ensure!(run["finished_at"].is_i64());

    let fetched = h
        .http
        .get(format!("{}/runs/{run_id}/logs", h.base))
        .bearer_auth(&h.user_token)
        .send()
        .await?
        .error_for_status()?
        .json::<Value>()
        .await?;
    anyhow::ensure!(fetched["logs"].as_array().context("logs")?.len() == 5);

    // Idempotent re-submission.
    let result = h
        .attempt_call(
            &runner_token,
            lt,
            run_id,
            "result",
            Some(json!({"status": "completed", "exit_code": 0})),
        )
        .await?;
    anyhow::ensure!(result.status() == 200);

    h.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_leases_hand_out_exactly_one_attempt() -> anyhow::Result<()> {
    let h = start_harness(60_000, 10_000, false).await?;
    let token_a = h.register_runner("worker-a").await?;
    let token_b = h.register_runner("worker-b").await?;
    h.create_run(json!({"app": "hello-world"})).await?;

    let (ra, rb) = tokio::join!(h.lease(&token_a), h.lease(&token_b));
    let (sa, sb) = (ra?.status(), rb?.status());
    let ok = [sa, sb].iter().filter(|s| s.as_u16() == 200).count();
    let empty = [sa, sb].iter().filter(|s| s.as_u16() == 204).count();
    anyhow::ensure!(
        ok == 1 && empty == 1,
        "expected one 200 and one 204, got {sa} and {sb}"
    );

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(sqlx::sqlite::SqliteConnectOptions::new().filename(&h.db_path))
        .await?;
    let attempts: i64 = sqlx::query_scalar("SELECT count(*) FROM run_attempts")
        .fetch_one(&pool)
        .await?;
    anyhow::ensure!(attempts == 1, "expected 1 attempt, got {attempts}");

    h.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn a_busy_runner_cannot_lease_again() -> anyhow::Result<()> {
    let h = start_harness(60_000, 10_000, false).await?;
    let runner_token = h.register_runner("worker-a").await?;
    h.create_run(json!({"app": "hello-world"})).await?;
    h.create_run(json!({"app": "hello-world"})).await?;

    h.lease_ok(&runner_token).await?;
    let resp = h.lease(&runner_token).await?;
    anyhow::ensure!(resp.status() == 409, "expected 409, got {}", resp.status());
    let body: Value = resp.json().await?;
    anyhow::ensure!(body["error"]["code"] == "runner_busy");

    h.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn expired_lease_requeues_until_budget_is_spent() -> anyhow::Result<()> {
    let h = start_harness(300, 50, true).await?;
    let token_a = h.register_runner("worker-a").await?;
    let run = h
        .create_run(json!({"app": "hello-world", "max_retries": 2}))
        .await?;
    let run_id = run["id"].as_i64().context("run id")?;

    // Worker A leases and goes silent.
    let lease_a = h.lease_ok(&token_a).await?;
    let lt_a = lease_a["lease_token"].as_str().context("token")?;

    let run = h.wait_for_status(run_id, "queued").await?;
    anyhow::ensure!(run["retry_count"] == 1);

    // The dead worker's token is fenced out.
    let late = h
        .attempt_call(
            &token_a,
            lt_a,
            run_id,
            "result",
            Some(json!({"status": "completed", "exit_code": 0})),
        )
        .await?;
    anyhow::ensure!(late.status() == 410, "expected 410, got {}", late.status());

    // Worker B finishes the retry.
    let token_b = h.register_runner("worker-b").await?;
    let lease_b = h.lease_ok(&token_b).await?;
    anyhow::ensure!(lease_b["attempt_no"] == 2);
    let lt_b = lease_b["lease_token"].as_str().context("token")?;
    h.attempt_call(&token_b, lt_b, run_id, "start", None)
        .await?
        .error_for_status()?;
    h.attempt_call(
        &token_b,
        lt_b,
        run_id,
        "result",
        Some(json!({"status": "completed", "exit_code": 0})),
    )
    .await?
    .error_for_status()?;

    let run = h.get_run(run_id).await?;
    anyhow::ensure!(run["status"] == "completed");

    h.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn expired_lease_without_budget_is_dead() -> anyhow::Result<()> {
    let h = start_harness(300, 50, true).await?;
    let runner_token = h.register_runner("worker-a").await?;
    let run = h.create_run(json!({"app": "hello-world"})).await?;
    let run_id = run["id"].as_i64().context("run id")?;

    h.lease_ok(&runner_token).await?;
    let run = h.wait_for_status(run_id, "dead").await?;
    anyhow::ensure!(run["retry_count"] == 0);

    h.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn cancel_mid_run_reaches_the_runner_and_converges() -> anyhow::Result<()> {
    let h = start_harness(60_000, 10_000, false).await?;
    let runner_token = h.register_runner("worker-a").await?;
    let run = h.create_run(json!({"app": "hello-world"})).await?;
    let run_id = run["id"].as_i64().context("run id")?;

    let lease = h.lease_ok(&runner_token).await?;
    let lt = lease["lease_token"].as_str().context("token")?;
    h.attempt_call(&runner_token, lt, run_id, "start", None)
        .await?
        .error_for_status()?;

    let cancel = h
        .http
        .post(format!("{}/runs/{run_id}/cancel", h.base))
        .bearer_auth(&h.user_token)
        .send()
        .await?;
    anyhow::ensure!(cancel.status() == 200);
    let cancel: Value = cancel.json().await?;
    anyhow::ensure!(cancel["status"] == "cancelling");

    let hb = h
        .attempt_call(&runner_token, lt, run_id, "heartbeat", None)
        .await?;
    anyhow::ensure!(hb.status() == 200);
    let hb: Value = hb.json().await?;
    anyhow::ensure!(hb["cancel_requested"] == true);
    anyhow::ensure!(hb["status"] == "cancelling");

    let result = h
        .attempt_call(
            &runner_token,
            lt,
            run_id,
            "result",
            Some(json!({"status": "cancelled"})),
        )
        .await?;
    anyhow::ensure!(result.status() == 200);

    let run = h.get_run(run_id).await?;
    anyhow::ensure!(run["status"] == "cancelled");

    h.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn completed_result_loses_against_a_pending_cancel() -> anyhow::Result<()> {
    let h = start_harness(60_000, 10_000, false).await?;
    let runner_token = h.register_runner("worker-a").await?;
    let run = h.create_run(json!({"app": "hello-world"})).await?;
    let run_id = run["id"].as_i64().context("run id")?;

    let lease = h.lease_ok(&runner_token).await?;
    let lt = lease["lease_token"].as_str().context("token")?;
    h.attempt_call(&runner_token, lt, run_id, "start", None)
        .await?
        .error_for_status()?;

    h.http
        .post(format!("{}/runs/{run_id}/cancel", h.base))
        .bearer_auth(&h.user_token)
        .send()
        .await?
        .error_for_status()?;

    // The runner finished before observing the cancel.
    let result = h
        .attempt_call(
            &runner_token,
            lt,
            run_id,
            "result",
            Some(json!({"status": "completed", "exit_code": 0})),
        )
        .await?;
    anyhow::ensure!(result.status() == 409, "expected 409, got {}", result.status());

    let run = h.get_run(run_id).await?;
    anyhow::ensure!(run["status"] == "cancelling");

    // Next heartbeat shows the cancel; the runner converges.
    let hb = h
        .attempt_call(&runner_token, lt, run_id, "heartbeat", None)
        .await?;
    let hb: Value = hb.json().await?;
    anyhow::ensure!(hb["cancel_requested"] == true);
    h.attempt_call(
        &runner_token,
        lt,
        run_id,
        "result",
        Some(json!({"status": "cancelled"})),
    )
    .await?
    .error_for_status()?;

    let run = h.get_run(run_id).await?;
    anyhow::ensure!(run["status"] == "cancelled");

    h.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn duplicate_log_seqs_are_dropped() -> anyhow::Result<()> {
    let h = start_harness(60_000, 10_000, false).await?;
    let runner_token = h.register_runner("worker-a").await?;
    let run = h.create_run(json!({"app": "hello-world"})).await?;
    let run_id = run["id"].as_i64().context("run id")?;

    let lease = h.lease_ok(&runner_token).await?;
    let lt = lease["lease_token"].as_str().context("token")?;

    let resp = h
        .attempt_call(
            &runner_token,
            lt,
            run_id,
            "logs",
            Some(json!({"logs": [
                {"seq": 1, "stream": "stdout", "line": "a"},
                {"seq": 1, "stream": "stdout", "line": "a-dup"},
                {"seq": 2, "stream": "stdout", "line": "b"},
            ]})),
        )
        .await?;
    anyhow::ensure!(resp.status() == 200);
    let body: Value = resp.json().await?;
    anyhow::ensure!(body["accepted"] == 2);

    let fetched = h
        .http
        .get(format!("{}/runs/{run_id}/logs", h.base))
        .bearer_auth(&h.user_token)
        .send()
        .await?
        .error_for_status()?
        .json::<Value>()
        .await?;
    let logs = fetched["logs"].as_array().context("logs")?;
    anyhow::ensure!(logs.len() == 2);
    anyhow::ensure!(logs[0]["seq"] == 1 && logs[0]["line"] == "a");
    anyhow::ensure!(logs[1]["seq"] == 2 && logs[1]["line"] == "b");

    h.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn oversized_log_batches_and_lines_are_rejected() -> anyhow::Result<()> {
    let h = start_harness(60_000, 10_000, false).await?;
    let runner_token = h.register_runner("worker-a").await?;
    let run = h.create_run(json!({"app": "hello-world"})).await?;
    let run_id = run["id"].as_i64().context("run id")?;

    let lease = h.lease_ok(&runner_token).await?;
    let lt = lease["lease_token"].as_str().context("token")?;

    let batch: Vec<Value> = (1..=101)
        .map(|seq| json!({"seq": seq, "stream": "stdout", "line": "x"}))
        .collect();
    let resp = h
        .attempt_call(&runner_token, lt, run_id, "logs", Some(json!({"logs": batch})))
        .await?;
    anyhow::ensure!(resp.status() == 413, "expected 413, got {}", resp.status());

    let long_line = "x".repeat(8 * 1024 + 1);
    let resp = h
        .attempt_call(
            &runner_token,
            lt,
            run_id,
            "logs",
            Some(json!({"logs": [{"seq": 1, "stream": "stdout", "line": long_line}]})),
        )
        .await?;
    anyhow::ensure!(resp.status() == 413, "expected 413, got {}", resp.status());

    h.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn auth_matrix_is_enforced() -> anyhow::Result<()> {
    let h = start_harness(60_000, 10_000, false).await?;
    let runner_token = h.register_runner("worker-a").await?;
    let run = h.create_run(json!({"app": "hello-world"})).await?;
    let run_id = run["id"].as_i64().context("run id")?;

    // No token at all.
    let resp = h.http.post(format!("{}/runs", h.base)).json(&json!({"app": "x"})).send().await?;
    anyhow::ensure!(resp.status() == 401);

    // Unknown token.
    let resp = h
        .http
        .get(format!("{}/runs/{run_id}", h.base))
        .bearer_auth("nope")
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 401);

    // A user token cannot act as a runner, and vice versa.
    let resp = h
        .http
        .post(format!("{}/runs/lease", h.base))
        .bearer_auth(&h.user_token)
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 403, "expected 403, got {}", resp.status());
    let resp = h
        .http
        .post(format!("{}/runs", h.base))
        .bearer_auth(&runner_token)
        .json(&json!({"app": "hello-world"}))
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 403, "expected 403, got {}", resp.status());

    // Attempt-scoped calls need the lease header and the right token.
    h.lease_ok(&runner_token).await?;
    let resp = h
        .http
        .post(format!("{}/runs/{run_id}/start", h.base))
        .bearer_auth(&runner_token)
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 401, "expected 401, got {}", resp.status());
    let resp = h
        .attempt_call(&runner_token, "wrong-token", run_id, "start", None)
        .await?;
    anyhow::ensure!(resp.status() == 410, "expected 410, got {}", resp.status());

    // Error envelope shape.
    let resp = h
        .http
        .get(format!("{}/runs/999999", h.base))
        .bearer_auth(&h.user_token)
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 404);
    let body: Value = resp.json().await?;
    anyhow::ensure!(body["error"]["code"] == "not_found");
    anyhow::ensure!(body["error"]["message"].is_string());

    h.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn artifact_endpoint_streams_with_headers_and_fences() -> anyhow::Result<()> {
    let h = start_harness(60_000, 10_000, false).await?;
    let runner_token = h.register_runner("worker-a").await?;
    let run = h.create_run(json!({"app": "hello-world"})).await?;
    let run_id = run["id"].as_i64().context("run id")?;

    let lease = h.lease_ok(&runner_token).await?;
    let lt = lease["lease_token"].as_str().context("token")?.to_string();

    let resp = h
        .http
        .get(format!("{}/runs/{run_id}/artifact", h.base))
        .bearer_auth(&runner_token)
        .header(LEASE_TOKEN_HEADER, &lt)
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 200, "artifact got {}", resp.status());
    let sha = resp
        .headers()
        .get("x-artifact-sha256")
        .and_then(|v| v.to_str().ok())
        .context("sha header")?
        .to_string();
    anyhow::ensure!(sha == sha256_hex(ARTIFACT_BYTES));
    anyhow::ensure!(
        resp.headers().get("x-entrypoint").and_then(|v| v.to_str().ok()) == Some("python main.py")
    );
    anyhow::ensure!(
        resp.headers().get("x-timeout-seconds").and_then(|v| v.to_str().ok()) == Some("300")
    );
    let bytes = resp.bytes().await?;
    anyhow::ensure!(bytes.as_ref() == ARTIFACT_BYTES);

    // Terminal attempt: the lease no longer grants the artifact.
    h.attempt_call(
        &runner_token,
        &lt,
        run_id,
        "result",
        Some(json!({"status": "failed", "exit_code": 1, "error_message": "boom"})),
    )
    .await?
    .error_for_status()?;
    let resp = h
        .http
        .get(format!("{}/runs/{run_id}/artifact", h.base))
        .bearer_auth(&runner_token)
        .header(LEASE_TOKEN_HEADER, &lt)
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 410, "expected 410, got {}", resp.status());

    h.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn cancelled_queued_run_never_reaches_a_runner() -> anyhow::Result<()> {
    let h = start_harness(60_000, 10_000, false).await?;
    let runner_token = h.register_runner("worker-a").await?;
    let run = h.create_run(json!({"app": "hello-world"})).await?;
    let run_id = run["id"].as_i64().context("run id")?;

    let cancel = h
        .http
        .post(format!("{}/runs/{run_id}/cancel", h.base))
        .bearer_auth(&h.user_token)
        .send()
        .await?
        .error_for_status()?
        .json::<Value>()
        .await?;
    anyhow::ensure!(cancel["status"] == "cancelled");

    // Cancel is idempotent and returns the same run object.
    let again = h
        .http
        .post(format!("{}/runs/{run_id}/cancel", h.base))
        .bearer_auth(&h.user_token)
        .send()
        .await?
        .error_for_status()?
        .json::<Value>()
        .await?;
    anyhow::ensure!(again == cancel);

    let resp = h.lease(&runner_token).await?;
    anyhow::ensure!(resp.status() == 204, "expected 204, got {}", resp.status());

    h.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn create_run_rejects_bad_input_and_unknown_entities() -> anyhow::Result<()> {
    let h = start_harness(60_000, 10_000, false).await?;

    let app = h.store.create_app(h.team_id, "strict-app").await?;
    h.store
        .publish_version(
            app.id,
            NewVersion {
                entrypoint: "python main.py",
                timeout_seconds: None,
                input_schema: Some(json!({
                    "type": "object",
                    "required": ["name"],
                    "properties": {"name": {"type": "string"}}
                })),
                artifact_key: "ignored/00000000-0000-0000-0000-000000000000.tar.gz",
                artifact_sha256: "deadbeef",
            },
        )
        .await?;

    let resp = h
        .http
        .post(format!("{}/runs", h.base))
        .bearer_auth(&h.user_token)
        .json(&json!({"app": "strict-app", "input": {"wrong": 1}}))
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 400, "expected 400, got {}", resp.status());
    let body: Value = resp.json().await?;
    anyhow::ensure!(body["error"]["code"] == "invalid_input");

    h.create_run(json!({"app": "strict-app", "input": {"name": "ok"}}))
        .await?;

    let resp = h
        .http
        .post(format!("{}/runs", h.base))
        .bearer_auth(&h.user_token)
        .json(&json!({"app": "no-such-app"}))
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 404);

    let resp = h
        .http
        .post(format!("{}/runners/register", h.base))
        .json(&json!({"name": "worker-a", "environment": "default"}))
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 201);
    let resp = h
        .http
        .post(format!("{}/runners/register", h.base))
        .json(&json!({"name": "worker-a", "environment": "default"}))
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 409, "expected 409, got {}", resp.status());

    h.server.shutdown().await?;
    Ok(())
}
