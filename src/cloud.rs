/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: cloud.rs
 *
 * Cloud Client (C5): register, heartbeat, pull, and report-result against
 * the cloud control plane. The `reqwest::Client` carries a configurable
 * `api_url` test seam so the base URL can be pointed at a mock server in
 * tests. `report_result` retries with exponential backoff (6 attempts,
 * 100ms-1.6s) before giving up and logging the result as lost.
 */

use crate::task::{Task, TaskResult};
use anyhow::{Context, Result};
use log::{error, info, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const RESULT_POST_BACKOFF_MS: [u64; 5] = [100, 200, 400, 800, 1600];
const RESULT_POST_ATTEMPTS: usize = 6;

#[derive(Debug, Deserialize)]
struct CloudEnvelope<T> {
    ok: bool,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    error: Option<CloudError>,
}

#[derive(Debug, Deserialize)]
struct CloudError {
    #[allow(dead_code)]
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub device_key: String,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    status: &'a str,
    current_tasks: &'a [Uuid],
}

#[derive(Debug, Deserialize, Default)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub pending_tasks: Vec<CloudTaskPayload>,
}

/// Closed record a cloud task payload parses into; unknown fields are
/// dropped by serde rather than carried as an untyped value.
#[derive(Debug, Deserialize)]
pub struct CloudTaskPayload {
    pub id: Uuid,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Milliseconds, per the wire contract; converted to seconds on ingest.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl CloudTaskPayload {
    pub fn into_task(self) -> Task {
        Task::new_cloud(
            self.id,
            self.command,
            self.cwd,
            self.env,
            self.timeout.map(|ms| ms.div_ceil(1000).max(1)),
        )
    }
}

#[derive(Debug, Serialize)]
struct ResultRequest<'a> {
    status: &'a str,
    exit_code: i32,
    stdout: &'a str,
    stderr: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    error: &'a str,
}

pub enum OnlineStatus {
    Online,
    Busy,
}

impl OnlineStatus {
    fn as_str(&self) -> &'static str {
        match self {
            OnlineStatus::Online => "online",
            OnlineStatus::Busy => "busy",
        }
    }
}

/// Owns the single `reqwest::Client` used for every cloud call and
/// serializes all operations behind one mutex so connection reuse and
/// backoff state stay coherent across callers.
pub struct CloudClient {
    client: Client,
    api_base_url: String,
    device_key: Mutex<Option<String>>,
    /// (email, password) used to re-authenticate via `register` when the
    /// cloud rejects `device_key` with 401. Absent if the config carries no
    /// account credentials, in which case a 401 cannot be recovered from.
    account_credentials: Option<(String, String)>,
    session: Mutex<()>,
}

impl CloudClient {
    pub fn new(
        api_base_url: String,
        device_key: Option<String>,
        account_credentials: Option<(String, String)>,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("failed to build reqwest client"),
            api_base_url,
            device_key: Mutex::new(device_key),
            account_credentials,
            session: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn with_api_url(api_base_url: String, device_key: Option<String>) -> Self {
        Self::new(api_base_url, device_key, None)
    }

    #[cfg(test)]
    pub fn with_account_credentials(
        api_base_url: String,
        device_key: Option<String>,
        email: String,
        password: String,
    ) -> Self {
        Self::new(api_base_url, device_key, Some((email, password)))
    }

    pub async fn device_key(&self) -> Option<String> {
        self.device_key.lock().await.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    async fn device_key_header(&self) -> Result<String> {
        self.device_key
            .lock()
            .await
            .clone()
            .context("cloud client has no device_key; register() must run first")
    }

    /// `POST /auth` — called once at startup if config carries no
    /// `device_key`. The resulting key is persisted by the caller.
    pub async fn register(&self, email: &str, password: &str) -> Result<String> {
        let _guard = self.session.lock().await;
        let url = self.url("/auth");
        let body = AuthRequest { email, password };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("register request failed")?;

        let envelope: CloudEnvelope<AuthResponse> =
            response.json().await.context("malformed register response")?;

        if !envelope.ok {
            let msg = envelope.error.map(|e| e.message).unwrap_or_default();
            anyhow::bail!("register rejected: {msg}");
        }

        let data = envelope.data.context("register response missing data")?;
        *self.device_key.lock().await = Some(data.device_key.clone());
        Ok(data.device_key)
    }

    /// One raw `POST /daemon/heartbeat` attempt with the current
    /// `device_key`. Returns `Ok(None)` on 401 so the caller can decide
    /// whether to re-register; any other failure is returned as `Err`.
    async fn heartbeat_once(
        &self,
        status: &OnlineStatus,
        current_tasks: &[Uuid],
    ) -> Result<Option<HeartbeatResponse>> {
        let key = self.device_key_header().await?;
        let url = self.url("/daemon/heartbeat");
        let body = HeartbeatRequest {
            status: status.as_str(),
            current_tasks,
        };

        let response = {
            let _guard = self.session.lock().await;
            self.client
                .post(&url)
                .header("X-Device-Key", key)
                .json(&body)
                .send()
                .await
                .context("heartbeat request failed")?
        };

        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }

        let envelope: CloudEnvelope<HeartbeatResponse> =
            response.json().await.context("malformed heartbeat response")?;

        if !envelope.ok {
            let msg = envelope.error.map(|e| e.message).unwrap_or_default();
            anyhow::bail!("heartbeat rejected: {msg}");
        }

        Ok(Some(envelope.data.unwrap_or_default()))
    }

    /// `POST /daemon/heartbeat`. Best-effort: a transient failure is
    /// returned for the caller to log and retry on the next tick. On 401
    /// this re-registers once using the stored account credentials and
    /// retries; if re-registration is unavailable or also rejected, the
    /// error carries the `cloud-reauth-exhausted` marker so the caller can
    /// demote cloud mode to degraded instead of retrying forever.
    pub async fn heartbeat(
        &self,
        status: OnlineStatus,
        current_tasks: &[Uuid],
    ) -> Result<HeartbeatResponse> {
        if let Some(response) = self.heartbeat_once(&status, current_tasks).await? {
            return Ok(response);
        }

        let Some((email, password)) = &self.account_credentials else {
            anyhow::bail!("cloud-reauth-exhausted: heartbeat unauthorized (401) and no account credentials to re-register with");
        };

        self.register(email, password)
            .await
            .context("cloud-reauth-exhausted: re-register after 401 failed")?;

        match self.heartbeat_once(&status, current_tasks).await? {
            Some(response) => Ok(response),
            None => anyhow::bail!("cloud-reauth-exhausted: heartbeat still unauthorized (401) after re-register"),
        }
    }

    /// `GET /daemon/tasks`. The server has already leased every returned
    /// task to RUNNING; the daemon treats each as already-owned.
    pub async fn pull_tasks(&self) -> Result<Vec<Task>> {
        let _guard = self.session.lock().await;
        let key = self.device_key_header().await?;
        let url = self.url("/daemon/tasks");

        let response = self
            .client
            .get(&url)
            .header("X-Device-Key", key)
            .send()
            .await
            .context("pull_tasks request failed")?;

        let envelope: CloudEnvelope<Vec<CloudTaskPayload>> =
            response.json().await.context("malformed pull_tasks response")?;

        if !envelope.ok {
            let msg = envelope.error.map(|e| e.message).unwrap_or_default();
            anyhow::bail!("pull_tasks rejected: {msg}");
        }

        Ok(envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .map(CloudTaskPayload::into_task)
            .collect())
    }

    /// `POST /daemon/tasks/:id/result`, at-least-once with exponential
    /// backoff. Returns `Ok(())` once acknowledged; after
    /// `RESULT_POST_ATTEMPTS` failed attempts the result is dropped and a
    /// `result-lost` line is logged.
    pub async fn report_result(&self, task_id: Uuid, result: &TaskResult) -> Result<()> {
        let key = self.device_key_header().await?;
        let url = self.url(&format!("/daemon/tasks/{task_id}/result"));

        let status = if result.is_success() { "completed" } else { "failed" };
        let body = ResultRequest {
            status,
            exit_code: result.exit_code,
            stdout: &result.stdout_tail,
            stderr: &result.stderr_tail,
            error: &result.error_message,
        };

        for attempt in 0..RESULT_POST_ATTEMPTS {
            let outcome = {
                let _guard = self.session.lock().await;
                self.client
                    .post(&url)
                    .header("X-Device-Key", &key)
                    .json(&body)
                    .send()
                    .await
            };

            match outcome {
                Ok(response) if response.status().is_success() => {
                    info!("task={task_id} result posted to cloud on attempt {}", attempt + 1);
                    return Ok(());
                }
                Ok(response) => {
                    warn!(
                        "task={task_id} result post attempt {} rejected: {}",
                        attempt + 1,
                        response.status()
                    );
                }
                Err(e) => {
                    warn!("task={task_id} result post attempt {} failed: {e}", attempt + 1);
                }
            }

            if let Some(delay) = RESULT_POST_BACKOFF_MS.get(attempt) {
                tokio::time::sleep(Duration::from_millis(*delay)).await;
            }
        }

        error!("kind=ResultDeliveryFailure reason=result-lost task={task_id}");
        anyhow::bail!("result-lost: task {task_id} result post exhausted all retries")
    }

    /// `POST /daemon/offline`. Used on graceful shutdown.
    pub async fn mark_offline(&self) -> Result<()> {
        let _guard = self.session.lock().await;
        let key = self.device_key_header().await?;
        let url = self.url("/daemon/offline");

        self.client
            .post(&url)
            .header("X-Device-Key", key)
            .send()
            .await
            .context("mark_offline request failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_persists_device_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true,"data":{"device_key":"abc123"}}"#)
            .create_async()
            .await;

        let client = CloudClient::with_api_url(server.url(), None);
        let key = client.register("dev@example.com", "pw").await.unwrap();
        assert_eq!(key, "abc123");
        assert_eq!(client.device_key().await.as_deref(), Some("abc123"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn pull_tasks_converts_millisecond_timeout_to_seconds() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/daemon/tasks")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"ok":true,"data":[{"id":"00000000-0000-0000-0000-000000000001","command":"echo hi","timeout":2500}]}"#,
            )
            .create_async()
            .await;

        let client = CloudClient::with_api_url(server.url(), Some("k".into()));
        let tasks = client.pull_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].timeout_sec, Some(3));
        assert_eq!(tasks[0].command, "echo hi");
    }

    #[tokio::test]
    async fn heartbeat_without_account_credentials_fails_fast_on_401() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/daemon/heartbeat")
            .with_status(401)
            .create_async()
            .await;

        let client = CloudClient::with_api_url(server.url(), Some("k".into()));
        let result = client.heartbeat(OnlineStatus::Online, &[]).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("cloud-reauth-exhausted"));
    }

    #[tokio::test]
    async fn heartbeat_reregisters_once_on_401_and_succeeds() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/daemon/heartbeat")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/auth")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true,"data":{"device_key":"fresh-key"}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/daemon/heartbeat")
            .match_header("X-Device-Key", "fresh-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true,"data":{"pending_tasks":[]}}"#)
            .create_async()
            .await;

        let client = CloudClient::with_account_credentials(
            server.url(),
            Some("stale-key".into()),
            "dev@example.com".into(),
            "pw".into(),
        );
        let result = client.heartbeat(OnlineStatus::Online, &[]).await;
        assert!(result.is_ok());
        assert_eq!(client.device_key().await.as_deref(), Some("fresh-key"));
    }

    #[tokio::test]
    async fn heartbeat_still_unauthorized_after_reregister_is_exhausted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/daemon/heartbeat")
            .with_status(401)
            .create_async()
            .await;
        server
            .mock("POST", "/auth")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true,"data":{"device_key":"fresh-key"}}"#)
            .create_async()
            .await;

        let client = CloudClient::with_account_credentials(
            server.url(),
            Some("stale-key".into()),
            "dev@example.com".into(),
            "pw".into(),
        );
        let result = client.heartbeat(OnlineStatus::Online, &[]).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("cloud-reauth-exhausted"));
    }

    #[tokio::test]
    async fn report_result_succeeds_after_one_retry() {
        let mut server = mockito::Server::new_async().await;
        let id = Uuid::nil();
        let path = format!("/daemon/tasks/{id}/result");

        let first = server
            .mock("POST", path.as_str())
            .with_status(500)
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("POST", path.as_str())
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .expect(1)
            .create_async()
            .await;

        let client = CloudClient::with_api_url(server.url(), Some("k".into()));
        let result = TaskResult {
            exit_code: 0,
            stdout_tail: "ok\n".into(),
            stderr_tail: String::new(),
            duration_ms: 5,
            error_message: String::new(),
        };

        client.report_result(id, &result).await.unwrap();
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn report_result_gives_up_after_exhausting_retries() {
        let mut server = mockito::Server::new_async().await;
        let id = Uuid::nil();
        let path = format!("/daemon/tasks/{id}/result");

        let mock = server
            .mock("POST", path.as_str())
            .with_status(500)
            .expect(RESULT_POST_ATTEMPTS)
            .create_async()
            .await;

        let client = CloudClient::with_api_url(server.url(), Some("k".into()));
        let result = TaskResult::rejected("boom");
        let outcome = client.report_result(id, &result).await;
        assert!(outcome.is_err());
        mock.assert_async().await;
    }
}
