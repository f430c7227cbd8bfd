/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: task.rs
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Where a [`Task`] was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    Email,
    Cloud,
}

/// A task's position in its lifecycle. Transitions are forward-only; the
/// four variants after `Running` are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Rejected,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }
}

/// Sentinel exit codes used by the executor and the policy gate. Real child
/// exit codes are always `>= 0`.
pub mod exit_code {
    pub const SPAWN_FAILURE: i32 = -1;
    pub const TIMEOUT: i32 = -2;
    pub const POLICY_REJECT: i32 = -3;
}

/// The outcome of a terminal [`Task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub error_message: String,
}

impl TaskResult {
    pub fn rejected(reason: &str) -> Self {
        Self {
            exit_code: exit_code::POLICY_REJECT,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            duration_ms: 0,
            error_message: reason.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The unit of work. Owned exclusively by the orchestrator (C6) once
/// constructed; every other component either produces one or consumes one by
/// value/reference, never mutates it behind the orchestrator's back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub source: TaskSource,
    pub command: String,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub timeout_sec: Option<u64>,
    /// Opaque routing handle: the sender's address for email tasks, the
    /// cloud-assigned task id echoed back for cloud tasks.
    pub originator: String,
    pub state: TaskState,
    pub received_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn new_email(
        command: String,
        cwd: Option<String>,
        timeout_sec: Option<u64>,
        originator: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: TaskSource::Email,
            command,
            cwd,
            env: HashMap::new(),
            timeout_sec,
            originator,
            state: TaskState::Pending,
            received_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    pub fn new_cloud(
        id: Uuid,
        command: String,
        cwd: Option<String>,
        env: HashMap<String, String>,
        timeout_sec: Option<u64>,
    ) -> Self {
        Self {
            id,
            source: TaskSource::Cloud,
            command,
            cwd,
            env,
            timeout_sec,
            originator: id.to_string(),
            state: TaskState::Pending,
            received_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    /// Resolve this task's effective working directory against the
    /// project-level default.
    pub fn effective_cwd<'a>(&'a self, project_path: &'a str) -> &'a str {
        self.cwd.as_deref().unwrap_or(project_path)
    }

    /// Resolve this task's effective timeout against the configured default.
    pub fn effective_timeout_sec(&self, default_timeout_sec: u64) -> u64 {
        self.timeout_sec.unwrap_or(default_timeout_sec)
    }

    pub fn mark_running(&mut self) {
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_terminal(&mut self, state: TaskState, result: TaskResult) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_cwd_falls_back_to_project_path() {
        let task = Task::new_email("echo hi".into(), None, None, "a@b.com".into());
        assert_eq!(task.effective_cwd("/home/dev/project"), "/home/dev/project");

        let task2 = Task::new_email("echo hi".into(), Some("/tmp".into()), None, "a@b.com".into());
        assert_eq!(task2.effective_cwd("/home/dev/project"), "/tmp");
    }

    #[test]
    fn effective_timeout_falls_back_to_default() {
        let task = Task::new_email("echo hi".into(), None, None, "a@b.com".into());
        assert_eq!(task.effective_timeout_sec(300), 300);

        let task2 = Task::new_email("echo hi".into(), None, Some(15), "a@b.com".into());
        assert_eq!(task2.effective_timeout_sec(300), 15);
    }

    #[test]
    fn mark_terminal_sets_completed_at_and_result() {
        let mut task = Task::new_email("echo hi".into(), None, None, "a@b.com".into());
        task.mark_running();
        assert_eq!(task.state, TaskState::Running);
        assert!(task.started_at.is_some());

        task.mark_terminal(TaskState::Completed, TaskResult {
            exit_code: 0,
            stdout_tail: "hi\n".into(),
            stderr_tail: String::new(),
            duration_ms: 12,
            error_message: String::new(),
        });
        assert!(task.state.is_terminal());
        assert!(task.completed_at.is_some());
        assert!(task.result.unwrap().is_success());
    }
}
