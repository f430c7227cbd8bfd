/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: executor.rs
 *
 * Task Executor (C2): spawns a shell child process, captures stdout/stderr
 * into bounded ring buffers, and enforces a per-task timeout by killing the
 * whole process group.
 */

use crate::task::{exit_code, TaskResult};
use log::warn;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex};

/// Cap per stream.
const RING_CAP: usize = 64 * 1024;
/// Grace period between terminate-signal and force-kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// A bounded output buffer that discards the *older* half of its content on
/// overflow (rather than refusing new writes), so the tail of a long-running
/// command's output is always what's retained.
struct RingBuffer {
    buf: Vec<u8>,
    cap: usize,
    dropped: usize,
}

impl RingBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap.min(64 * 1024)),
            cap,
            dropped: 0,
        }
    }

    fn push(&mut self, mut data: &[u8]) {
        // If even a single overflow-eviction round can't make room (data
        // itself larger than cap), truncate the incoming chunk first.
        if data.len() > self.cap {
            let excess = data.len() - self.cap;
            self.dropped += excess;
            data = &data[excess..];
        }

        while self.buf.len() + data.len() > self.cap {
            let half = (self.buf.len() / 2).max(1).min(self.buf.len());
            self.dropped += half;
            self.buf.drain(0..half);
            if self.buf.is_empty() {
                break;
            }
        }

        self.buf.extend_from_slice(data);
    }

    fn finalize(self) -> String {
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        if self.dropped > 0 {
            format!("[truncated: {} bytes dropped]\n{text}", self.dropped)
        } else {
            text
        }
    }
}

async fn pump(mut reader: impl tokio::io::AsyncRead + Unpin, buf: Arc<Mutex<RingBuffer>>) {
    let mut tmp = [0u8; 8192];
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.lock().await.push(&tmp[..n]),
        }
    }
}

fn build_command(command: &str, cwd: &str, env: &HashMap<String, String>) -> Command {
    #[cfg(unix)]
    let mut cmd = {
        let mut c = Command::new("/bin/sh");
        c.arg("-c").arg(command);
        c
    };
    #[cfg(windows)]
    let mut cmd = {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    };

    cmd.current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        // SAFETY: setpgid is async-signal-safe per POSIX; this makes the
        // shell a process group leader so the whole subtree can be signaled
        // together on timeout.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
    }

    cmd
}

#[cfg(unix)]
fn terminate_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(windows)]
fn terminate_group(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/PID", &pid.to_string()])
        .output();
}

#[cfg(windows)]
fn kill_group(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .output();
}

/// Marker prefix on [`TaskResult::error_message`] that distinguishes a
/// daemon-shutdown cancellation from a genuine per-task timeout, even though
/// both share `exit_code::TIMEOUT` (the process was killed rather than
/// exiting on its own). The orchestrator matches on this prefix to choose
/// `TaskState::Cancelled` over `TaskState::Timeout`.
pub const CANCELLED_MARKER: &str = "cancelled:";

/// Waits for `cancel` to carry a shutdown broadcast. A channel closed
/// without ever sending (e.g. a test's throwaway sender already dropped)
/// is treated as "no cancellation will ever arrive" rather than an
/// immediate cancel, so it never resolves in that case.
async fn wait_for_cancel(cancel: &mut broadcast::Receiver<()>) {
    loop {
        match cancel.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

enum StopReason {
    TimedOut,
    Cancelled,
}

/// Run `command` to completion, until `timeout_sec` elapses, or until
/// `cancel` carries a shutdown broadcast — whichever happens first. On
/// timeout or cancellation the whole process group is terminate-signaled,
/// then force-killed after a grace period if it hasn't exited.
pub async fn execute(
    command: &str,
    cwd: &str,
    env: &HashMap<String, String>,
    timeout_sec: u64,
    cancel: &mut broadcast::Receiver<()>,
) -> TaskResult {
    let start = Instant::now();

    let mut cmd = build_command(command, cwd, env);
    let mut child: Child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return TaskResult {
                exit_code: exit_code::SPAWN_FAILURE,
                stdout_tail: String::new(),
                stderr_tail: String::new(),
                duration_ms: start.elapsed().as_millis() as u64,
                error_message: e.to_string(),
            };
        }
    };

    let pid = child.id().unwrap_or(0);
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_buf = Arc::new(Mutex::new(RingBuffer::new(RING_CAP)));
    let stderr_buf = Arc::new(Mutex::new(RingBuffer::new(RING_CAP)));

    let stdout_task = stdout.map(|r| tokio::spawn(pump(r, stdout_buf.clone())));
    let stderr_task = stderr.map(|r| tokio::spawn(pump(r, stderr_buf.clone())));

    let timeout_dur = Duration::from_secs(timeout_sec);
    let mut wait_fut = Box::pin(child.wait());
    let sleep_fut = tokio::time::sleep(timeout_dur);
    tokio::pin!(sleep_fut);

    let stop_reason = tokio::select! {
        result = &mut wait_fut => Ok(result),
        _ = &mut sleep_fut => Err(StopReason::TimedOut),
        _ = wait_for_cancel(cancel) => Err(StopReason::Cancelled),
    };

    let (status, stop_reason) = match stop_reason {
        Ok(result) => (result, None),
        Err(reason) => {
            terminate_group(pid);
            let status = match tokio::time::timeout(KILL_GRACE, &mut wait_fut).await {
                Ok(result) => result,
                Err(_) => {
                    kill_group(pid);
                    wait_fut.await
                }
            };
            (status, Some(reason))
        }
    };

    if let Some(t) = stdout_task {
        let _ = t.await;
    }
    if let Some(t) = stderr_task {
        let _ = t.await;
    }

    // Both pump tasks have been awaited above, so no other clone of these
    // Arcs can still be alive.
    let stdout_tail = Arc::into_inner(stdout_buf)
        .expect("stdout pump task finished")
        .into_inner()
        .finalize();
    let stderr_tail = Arc::into_inner(stderr_buf)
        .expect("stderr pump task finished")
        .into_inner()
        .finalize();

    let duration_ms = start.elapsed().as_millis() as u64;

    match stop_reason {
        Some(StopReason::TimedOut) => TaskResult {
            exit_code: exit_code::TIMEOUT,
            stdout_tail,
            stderr_tail,
            duration_ms,
            error_message: format!("timeout after {timeout_sec}s"),
        },
        Some(StopReason::Cancelled) => TaskResult {
            exit_code: exit_code::TIMEOUT,
            stdout_tail,
            stderr_tail,
            duration_ms,
            error_message: format!("{CANCELLED_MARKER} daemon shutting down"),
        },
        None => match status {
            Ok(status) => TaskResult {
                exit_code: status.code().unwrap_or(-1),
                stdout_tail,
                stderr_tail,
                duration_ms,
                error_message: String::new(),
            },
            Err(e) => {
                warn!("process wait() failed for pid {pid}: {e}");
                TaskResult {
                    exit_code: exit_code::SPAWN_FAILURE,
                    stdout_tail,
                    stderr_tail,
                    duration_ms,
                    error_message: e.to_string(),
                }
            }
        },
    }
}
