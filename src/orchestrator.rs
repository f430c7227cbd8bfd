/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: orchestrator.rs
 *
 * Daemon Orchestrator (C6): owns the task queue, the running set, and the
 * bounded history, and runs the four control loops (poll, heartbeat,
 * dispatch, shutdown-aware workers) coordinated by a `broadcast` shutdown
 * channel fanned out to each loop and task worker.
 */

use crate::cloud::{CloudClient, OnlineStatus};
use crate::config::DaemonConfig;
use crate::email_sink::EmailSink;
use crate::email_source::EmailSource;
use crate::executor;
use crate::security::SecurityPolicy;
use crate::task::{exit_code, Task, TaskResult, TaskSource, TaskState};
use futures::FutureExt;
use log::{error, info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use uuid::Uuid;

const HISTORY_CAPACITY: usize = 200;
const CANCEL_GRACE_EXTRA: Duration = Duration::from_secs(10);
const STATUS_WRITE_INTERVAL: Duration = Duration::from_secs(5);
const STATUS_FILE_NAME: &str = "daemon.status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Ok,
    Degraded,
    Disabled,
}

impl HealthState {
    fn label(self, reason: Option<&str>) -> String {
        match self {
            HealthState::Ok => "ok".to_string(),
            HealthState::Disabled => "disabled".to_string(),
            HealthState::Degraded => format!("degraded:{}", reason.unwrap_or("unknown")),
        }
    }
}

/// One line of `daemon status`'s component table, modeled as a type
/// rather than left as raw text.
#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub component: &'static str,
    pub state: HealthState,
    pub reason: Option<String>,
}

impl ComponentHealth {
    fn ok(component: &'static str) -> Self {
        Self { component, state: HealthState::Ok, reason: None }
    }

    fn disabled(component: &'static str) -> Self {
        Self { component, state: HealthState::Disabled, reason: None }
    }

    fn degraded(component: &'static str, reason: impl Into<String>) -> Self {
        Self { component, state: HealthState::Degraded, reason: Some(reason.into()) }
    }

    pub fn line(&self) -> String {
        format!("{}: {}", self.component, self.state.label(self.reason.as_deref()))
    }
}

/// Snapshot of daemon state, written periodically to
/// `<config_dir>/daemon.status.json` so a separate `ccjkd status` process
/// invocation (which is not the running daemon) can read live state.
/// Component lines are pre-formatted via [`ComponentHealth::line`] so the
/// reader doesn't need to reconstruct the `ok`/`degraded:<reason>`/
/// `disabled` format itself.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct StatusSnapshot {
    pub mode: crate::config::DaemonMode,
    pub uptime_secs: i64,
    pub running: usize,
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
    pub components: Vec<String>,
}

struct SharedState {
    queue: VecDeque<Task>,
    running: HashMap<Uuid, Task>,
    history: VecDeque<Task>,
    email_degraded: bool,
    cloud_degraded: bool,
    last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            running: HashMap::new(),
            history: VecDeque::new(),
            email_degraded: false,
            cloud_degraded: false,
            last_heartbeat_at: None,
        }
    }

    fn push_history(&mut self, task: Task) {
        if self.history.len() >= HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(task);
    }
}

pub struct Orchestrator {
    config: DaemonConfig,
    policy: SecurityPolicy,
    email_source: Option<EmailSource>,
    email_sink: Option<Arc<EmailSink>>,
    cloud: Option<Arc<CloudClient>>,
    state: Arc<Mutex<SharedState>>,
    started_at: chrono::DateTime<chrono::Utc>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Orchestrator {
    pub fn new(
        config: DaemonConfig,
        email_source: Option<EmailSource>,
        email_sink: Option<Arc<EmailSink>>,
        cloud: Option<Arc<CloudClient>>,
    ) -> Self {
        let policy = config.security_policy();
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            policy,
            email_source,
            email_sink,
            cloud,
            state: Arc::new(Mutex::new(SharedState::new())),
            started_at: chrono::Utc::now(),
            shutdown_tx,
        }
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Runs the poll, heartbeat, and dispatch loops concurrently until a
    /// shutdown signal is observed by all three, then drains `running` with
    /// a `taskTimeoutSec + 10s` grace.
    pub async fn run(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks));

        let poll_handle = {
            let this = self.clone();
            let mut rx = this.shutdown_tx.subscribe();
            tokio::spawn(async move { this.poll_loop(&mut rx).await })
        };

        let heartbeat_handle = {
            let this = self.clone();
            let mut rx = this.shutdown_tx.subscribe();
            tokio::spawn(async move { this.heartbeat_loop(&mut rx).await })
        };

        let dispatch_handle = {
            let this = self.clone();
            let mut rx = this.shutdown_tx.subscribe();
            tokio::spawn(async move { this.dispatch_loop(&mut rx, semaphore).await })
        };

        let status_handle = {
            let this = self.clone();
            let mut rx = this.shutdown_tx.subscribe();
            tokio::spawn(async move { this.status_loop(&mut rx).await })
        };

        let _ = tokio::join!(poll_handle, heartbeat_handle, dispatch_handle, status_handle);

        self.drain_running_with_grace().await;
        self.write_status_snapshot().await;
    }

    /// Computes the current [`StatusSnapshot`]; does not touch disk.
    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let components = self.health().await.iter().map(ComponentHealth::line).collect();
        let state = self.state.lock().await;
        StatusSnapshot {
            mode: self.config.mode,
            uptime_secs: self.uptime().num_seconds(),
            running: state.running.len(),
            last_heartbeat_at: state.last_heartbeat_at,
            components,
        }
    }

    /// Best-effort: a write failure is logged, never fatal to the daemon.
    async fn write_status_snapshot(&self) {
        let path = match crate::config::config_dir() {
            Ok(dir) => dir.join(STATUS_FILE_NAME),
            Err(e) => {
                warn!("kind=StatusWriteFailure error={e}");
                return;
            }
        };
        let snapshot = self.status_snapshot().await;
        let bytes = match serde_json::to_vec_pretty(&snapshot) {
            Ok(b) => b,
            Err(e) => {
                warn!("kind=StatusWriteFailure error={e}");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            warn!("kind=StatusWriteFailure path={} error={e}", path.display());
        }
    }

    async fn status_loop(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(STATUS_WRITE_INTERVAL);
        ticker.tick().await;
        self.write_status_snapshot().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("status loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.write_status_snapshot().await;
                }
            }
        }
    }

    async fn poll_loop(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.check_interval_sec));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("poll loop stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let mut cloud_tasks = Vec::new();
            if self.config.mode.uses_cloud() && !self.state.lock().await.cloud_degraded {
                if let Some(cloud) = &self.cloud {
                    match cloud.pull_tasks().await {
                        Ok(tasks) => cloud_tasks = tasks,
                        Err(e) => warn!("kind=TransportError component=cloud operation=pull_tasks error={e}"),
                    }
                }
            }

            let mut email_tasks = Vec::new();
            if self.config.mode.uses_email() && !self.state.lock().await.email_degraded {
                if let Some(source) = &self.email_source {
                    match source.poll().await {
                        Ok(tasks) => email_tasks = tasks,
                        Err(e) if EmailSource::is_auth_error(&e) => {
                            error!("kind=AuthError component=email_source error={e}");
                            self.state.lock().await.email_degraded = true;
                        }
                        Err(e) => warn!("kind=TransportError component=email_source error={e}"),
                    }
                }
            }

            if !cloud_tasks.is_empty() || !email_tasks.is_empty() {
                let mut state = self.state.lock().await;
                // Hybrid tie-break: cloud-sourced tasks enqueue before
                // email-sourced ones discovered in the same tick.
                for t in cloud_tasks {
                    state.queue.push_back(t);
                }
                for t in email_tasks {
                    state.queue.push_back(t);
                }
            }
        }
    }

    async fn heartbeat_loop(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        if !self.config.mode.uses_cloud() {
            return;
        }
        let Some(cloud) = self.cloud.clone() else { return };

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_sec));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("heartbeat loop stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let (status, task_ids) = {
                let state = self.state.lock().await;
                let status = if state.running.is_empty() { OnlineStatus::Online } else { OnlineStatus::Busy };
                let ids: Vec<Uuid> = state.running.keys().copied().collect();
                (status, ids)
            };

            match cloud.heartbeat(status, &task_ids).await {
                Ok(_) => {
                    let mut state = self.state.lock().await;
                    state.last_heartbeat_at = Some(chrono::Utc::now());
                    state.cloud_degraded = false;
                }
                Err(e) if e.to_string().contains("cloud-reauth-exhausted") => {
                    error!("kind=AuthError component=cloud operation=heartbeat error={e}");
                    let mut state = self.state.lock().await;
                    state.cloud_degraded = true;
                }
                Err(e) => {
                    warn!("kind=TransportError component=cloud operation=heartbeat error={e}");
                }
            }
        }
    }

    async fn dispatch_loop(&self, shutdown_rx: &mut broadcast::Receiver<()>, semaphore: Arc<Semaphore>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("dispatch loop stopping; no further tasks will be enqueued for execution");
                    return;
                }
                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { return };

                    let task = {
                        let mut state = self.state.lock().await;
                        state.queue.pop_front()
                    };

                    let Some(task) = task else {
                        drop(permit);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    };

                    self.dispatch_one(task, permit).await;
                }
            }
        }
    }

    async fn dispatch_one(&self, mut task: Task, permit: tokio::sync::OwnedSemaphorePermit) {
        let decision = self.policy.decide(&task.originator, &task.command);

        if let crate::security::Decision::Deny(reason, detail) = decision {
            let result = TaskResult::rejected(&format!("{reason}: {detail}"));
            task.mark_terminal(TaskState::Rejected, result);
            info!("kind=POLICY_REJECT task={} reason={reason}", task.id);
            self.route_result(task).await;
            drop(permit);
            return;
        }

        task.mark_running();
        let task_id = task.id;
        {
            let mut state = self.state.lock().await;
            state.running.insert(task_id, task.clone());
        }

        let project_path = self.config.project_path.clone();
        let default_timeout = self.config.task_timeout_sec;
        let state = self.state.clone();
        let this_email_sink = self.email_sink.clone();
        let this_cloud = self.cloud.clone();
        let mut cancel_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let cwd = task.effective_cwd(&project_path).to_string();
            let timeout_sec = task.effective_timeout_sec(default_timeout);

            let result = std::panic::AssertUnwindSafe(executor::execute(
                &task.command,
                &cwd,
                &task.env,
                timeout_sec,
                &mut cancel_rx,
            ))
            .catch_unwind()
            .await;

            let result = match result {
                Ok(r) => r,
                Err(_) => TaskResult {
                    exit_code: exit_code::SPAWN_FAILURE,
                    stdout_tail: String::new(),
                    stderr_tail: String::new(),
                    duration_ms: 0,
                    error_message: "kind=PanicRecovery task worker panicked".to_string(),
                },
            };

            let terminal_state = terminal_state_for(&result);
            task.mark_terminal(terminal_state, result);

            {
                let mut state = state.lock().await;
                state.running.remove(&task_id);
                state.push_history(task.clone());
            }

            route_terminal_task(task, this_email_sink, this_cloud).await;
            drop(permit);
        });
    }

    async fn route_result(&self, task: Task) {
        {
            let mut state = self.state.lock().await;
            state.push_history(task.clone());
        }
        route_terminal_task(task, self.email_sink.clone(), self.cloud.clone()).await;
    }

    /// Health status for `daemon status`'s component-by-component line.
    pub async fn health(&self) -> Vec<ComponentHealth> {
        let state = self.state.lock().await;
        let mut lines = Vec::new();

        lines.push(if self.config.mode.uses_email() {
            if state.email_degraded {
                ComponentHealth::degraded("email", "IMAP login rejected")
            } else {
                ComponentHealth::ok("email")
            }
        } else {
            ComponentHealth::disabled("email")
        });

        lines.push(if self.config.mode.uses_cloud() {
            if state.cloud_degraded {
                ComponentHealth::degraded("cloud", "401 after re-register")
            } else {
                ComponentHealth::ok("cloud")
            }
        } else {
            ComponentHealth::disabled("cloud")
        });

        lines
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    pub fn uptime(&self) -> chrono::Duration {
        chrono::Utc::now() - self.started_at
    }

    async fn drain_running_with_grace(&self) {
        let grace = Duration::from_secs(self.config.task_timeout_sec) + CANCEL_GRACE_EXTRA;
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            let remaining = self.state.lock().await.running.len();
            if remaining == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let state = self.state.lock().await;
                for (id, task) in state.running.iter() {
                    error!(
                        "kind=ResultDeliveryFailure reason=shutdown-grace-exceeded task={id} command={}",
                        task.command
                    );
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

fn terminal_state_for(result: &TaskResult) -> TaskState {
    if result.error_message.starts_with(executor::CANCELLED_MARKER) {
        return TaskState::Cancelled;
    }
    match result.exit_code {
        exit_code::TIMEOUT => TaskState::Timeout,
        exit_code::SPAWN_FAILURE => TaskState::Failed,
        0 => TaskState::Completed,
        _ => TaskState::Failed,
    }
}

async fn route_terminal_task(task: Task, email_sink: Option<Arc<EmailSink>>, cloud: Option<Arc<CloudClient>>) {
    let Some(result) = task.result.clone() else { return };

    match task.source {
        TaskSource::Email => {
            if let Some(sink) = email_sink {
                if let Err(e) = sink.send_result(&task, &result).await {
                    error!(
                        "kind=ResultDeliveryFailure component=email task={} error={e} result={:?}",
                        task.id, result
                    );
                }
            }
        }
        TaskSource::Cloud => {
            if let Some(cloud) = cloud {
                if let Err(e) = cloud.report_result(task.id, &result).await {
                    error!(
                        "kind=ResultDeliveryFailure component=cloud task={} error={e} result={:?}",
                        task.id, result
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonMode;
    use std::collections::HashSet;

    fn test_config() -> DaemonConfig {
        DaemonConfig {
            mode: DaemonMode::Email,
            email: None,
            cloud: None,
            allowed_senders: HashSet::from(["alice@example.com".to_string()]),
            command_allow_prefixes: vec!["echo ".to_string(), "sleep ".to_string()],
            command_deny_substrings: SecurityPolicy::default_deny_substrings(),
            max_command_length: 4096,
            project_path: "/tmp".to_string(),
            check_interval_sec: 30,
            task_timeout_sec: 5,
            heartbeat_interval_sec: 30,
            max_concurrent_tasks: 2,
            log_file: None,
            log_level: None,
            quiet: true,
        }
    }

    #[tokio::test]
    async fn denied_task_is_rejected_without_running() {
        let orch = Arc::new(Orchestrator::new(test_config(), None, None, None));
        let mut task = Task::new_email("rm -rf /".into(), None, None, "alice@example.com".into());
        task.mark_running();

        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.acquire_owned().await.unwrap();
        orch.dispatch_one(task, permit).await;

        assert_eq!(orch.running_count().await, 0);
    }

    #[tokio::test]
    async fn running_count_respects_concurrency_limit() {
        let orch = Orchestrator::new(test_config(), None, None, None);
        assert_eq!(orch.running_count().await, 0);
    }

    /// §8 scenario 6: three `sleep 1` tasks with `max_concurrent_tasks=2`.
    /// At most two run at once; all three eventually reach COMPLETED.
    #[tokio::test]
    async fn concurrency_limit_bounds_three_queued_tasks() {
        let mut cfg = test_config();
        cfg.max_concurrent_tasks = 2;
        let orch = Arc::new(Orchestrator::new(cfg, None, None, None));

        {
            let mut state = orch.state.lock().await;
            for _ in 0..3 {
                state.queue.push_back(Task::new_email(
                    "sleep 1".into(),
                    None,
                    None,
                    "alice@example.com".into(),
                ));
            }
        }

        let semaphore = Arc::new(Semaphore::new(2));
        let (_shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let dispatch_handle = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.dispatch_loop(&mut shutdown_rx, semaphore).await })
        };

        tokio::time::sleep(Duration::from_millis(400)).await;
        let running_mid = orch.running_count().await;
        assert!(running_mid <= 2, "running={running_mid} exceeds max_concurrent_tasks=2");
        assert!(running_mid >= 1);

        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(orch.running_count().await, 0);
        assert_eq!(orch.state.lock().await.history.len(), 3);

        dispatch_handle.abort();
    }

    #[test]
    fn health_label_formats_degraded_with_reason() {
        let health = ComponentHealth::degraded("cloud", "401 after re-register");
        assert_eq!(health.line(), "cloud: degraded:401 after re-register");
    }

    #[tokio::test]
    async fn health_reports_email_degraded_once_auth_fails() {
        let orch = Orchestrator::new(test_config(), None, None, None);
        orch.state.lock().await.email_degraded = true;

        let health = orch.health().await;
        let email = health.iter().find(|h| h.component == "email").unwrap();
        assert_eq!(email.state, HealthState::Degraded);
        assert_eq!(email.reason.as_deref(), Some("IMAP login rejected"));
    }

    #[test]
    fn terminal_state_maps_sentinel_exit_codes() {
        assert_eq!(terminal_state_for(&TaskResult::rejected("x")), TaskState::Failed);
        assert_eq!(
            terminal_state_for(&TaskResult {
                exit_code: exit_code::TIMEOUT,
                stdout_tail: String::new(),
                stderr_tail: String::new(),
                duration_ms: 0,
                error_message: String::new(),
            }),
            TaskState::Timeout
        );
    }
}
