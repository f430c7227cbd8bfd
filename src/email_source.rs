/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: email_source.rs
 *
 * Email Source (C3): polls IMAP `UNSEEN`, turns eligible messages into
 * `Task`s. Each poll opens its own connection (connect → select → search →
 * fetch → logout) rather than holding a session open across ticks.
 */

use crate::config::EmailConfig;
use crate::task::Task;
use anyhow::{Context, Result};
use async_imap::Session;
use async_native_tls::{TlsConnector, TlsStream};
use futures::StreamExt;
use log::{info, warn};
use mail_parser::MessageParser;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

const SUBJECT_PREFIX: &str = "[CCJK] ";
/// No single IMAP call may block the poll loop past this.
const IMAP_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type ImapSession = Session<TlsStream<Compat<TcpStream>>>;

pub struct EmailSource {
    config: EmailConfig,
    password: String,
    allowed_senders: std::collections::HashSet<String>,
    default_cwd: String,
}

/// What happened to a single fetched message, for logging/metrics.
#[derive(Debug, PartialEq, Eq)]
enum IngestOutcome {
    Enqueued,
    DroppedUnknownSender,
    DroppedBadSubject,
    DroppedEmptyBody,
}

impl EmailSource {
    pub fn new(
        config: EmailConfig,
        password: String,
        allowed_senders: std::collections::HashSet<String>,
        default_cwd: String,
    ) -> Self {
        Self {
            config,
            password,
            allowed_senders: allowed_senders.into_iter().map(|s| s.to_lowercase()).collect(),
            default_cwd,
        }
    }

    async fn connect(&self) -> Result<ImapSession> {
        let addr = format!("{}:{}", self.config.imap_host, self.config.imap_port);
        let tcp_stream = tokio::time::timeout(IMAP_CALL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect to {addr} timed out"))?
            .with_context(|| format!("failed to connect to {addr}"))?;

        let tls = TlsConnector::new();
        let tls_stream = tokio::time::timeout(
            IMAP_CALL_TIMEOUT,
            tls.connect(&self.config.imap_host, tcp_stream.compat()),
        )
        .await
        .map_err(|_| anyhow::anyhow!("TLS handshake timed out"))?
        .context("TLS handshake failed")?;

        let client = async_imap::Client::new(tls_stream);
        let session = tokio::time::timeout(
            IMAP_CALL_TIMEOUT,
            client.login(&self.config.address, &self.password),
        )
        .await
        .map_err(|_| anyhow::anyhow!("IMAP LOGIN timed out"))?
        .map_err(|e| anyhow::anyhow!("imap-auth-rejected: IMAP login failed: {:?}", e.0))?;

        Ok(session)
    }

    /// True if `err` (as returned by [`Self::poll`]) is an IMAP login
    /// rejection rather than a transient network/protocol error. Callers use
    /// this to distinguish "retry next tick" from "stop polling until an
    /// operator fixes the credentials".
    pub fn is_auth_error(err: &anyhow::Error) -> bool {
        err.to_string().contains("imap-auth-rejected")
    }

    /// One poll tick: connect, search UNSEEN, ingest each eligible message,
    /// flag every examined message `\Seen` (whether ingested or dropped),
    /// then logout.
    pub async fn poll(&self) -> Result<Vec<Task>> {
        let mut session = self.connect().await?;
        tokio::time::timeout(IMAP_CALL_TIMEOUT, session.select(&self.config.imap_folder))
            .await
            .map_err(|_| anyhow::anyhow!("IMAP SELECT timed out"))?
            .with_context(|| format!("failed to select {}", self.config.imap_folder))?;

        let search_result = tokio::time::timeout(IMAP_CALL_TIMEOUT, session.search("UNSEEN"))
            .await
            .map_err(|_| anyhow::anyhow!("UNSEEN search timed out"))?
            .context("UNSEEN search failed")?;
        let mut tasks = Vec::new();

        if search_result.is_empty() {
            let _ = tokio::time::timeout(IMAP_CALL_TIMEOUT, session.logout()).await;
            return Ok(tasks);
        }

        let seq_set: Vec<String> = search_result.iter().map(|n| n.to_string()).collect();
        let sequence_set = seq_set.join(",");

        let mut to_flag_seen: Vec<String> = Vec::new();

        {
            let mut fetch_stream = tokio::time::timeout(IMAP_CALL_TIMEOUT, session.fetch(&sequence_set, "RFC822"))
                .await
                .map_err(|_| anyhow::anyhow!("FETCH timed out"))?
                .context("FETCH failed")?;

            loop {
                let next = match tokio::time::timeout(IMAP_CALL_TIMEOUT, fetch_stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!("timed out reading FETCH stream; stopping early this tick");
                        break;
                    }
                };
                let Some(fetch_result) = next else { break };

                let message = match fetch_result {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("error reading fetch result: {e}");
                        continue;
                    }
                };

                let seq_num = message.message.to_string();
                let Some(body) = message.body() else {
                    continue;
                };

                match self.ingest(body) {
                    (IngestOutcome::Enqueued, Some(task)) => {
                        tasks.push(task);
                        to_flag_seen.push(seq_num);
                    }
                    (outcome, _) => {
                        log_drop(&outcome);
                        to_flag_seen.push(seq_num);
                    }
                }
            }
        }

        // Flag `\Seen` only after enqueue (or drop-decision) completes for
        // every message examined this tick — the at-least-once boundary.
        if !to_flag_seen.is_empty() {
            let set = to_flag_seen.join(",");
            let store_stream = tokio::time::timeout(IMAP_CALL_TIMEOUT, session.store(&set, "+FLAGS (\\Seen)"))
                .await
                .map_err(|_| anyhow::anyhow!("STORE timed out"))?
                .context("failed to flag messages Seen")?;
            futures::pin_mut!(store_stream);
            loop {
                match tokio::time::timeout(IMAP_CALL_TIMEOUT, store_stream.next()).await {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(_) => {
                        warn!("timed out reading STORE stream");
                        break;
                    }
                }
            }
        }

        let _ = tokio::time::timeout(IMAP_CALL_TIMEOUT, session.logout()).await;
        Ok(tasks)
    }

    fn ingest(&self, raw: &[u8]) -> (IngestOutcome, Option<Task>) {
        let Some(message) = MessageParser::default().parse(raw) else {
            return (IngestOutcome::DroppedEmptyBody, None);
        };

        let from = message
            .from()
            .and_then(|f| f.first())
            .and_then(|addr| addr.address())
            .unwrap_or_default()
            .to_string();

        if !self.allowed_senders.contains(&from.to_lowercase()) {
            return (IngestOutcome::DroppedUnknownSender, None);
        }

        let subject = message.subject().unwrap_or_default();
        if !subject.starts_with(SUBJECT_PREFIX) {
            return (IngestOutcome::DroppedBadSubject, None);
        }

        let body = message
            .body_text(0)
            .map(|c| c.to_string())
            .or_else(|| message.body_html(0).map(|c| strip_html(&c)))
            .unwrap_or_default();

        let mut lines = body.lines();
        let Some(command) = lines.by_ref().find(|l| !l.trim().is_empty()) else {
            return (IngestOutcome::DroppedEmptyBody, None);
        };

        let mut cwd: Option<String> = None;
        let mut timeout_sec: Option<u64> = None;
        for line in lines {
            let trimmed = line.trim();
            let lower = trimmed.to_lowercase();
            // ASCII-only case folding, so byte offsets into `trimmed` stay
            // aligned with offsets into `lower`.
            if lower.starts_with("cwd:") {
                cwd = Some(trimmed["cwd:".len()..].trim().to_string());
            } else if lower.starts_with("timeout:") {
                let value = trimmed["timeout:".len()..].trim();
                timeout_sec = value.parse().ok();
            }
        }

        let task = Task::new_email(
            command.trim().to_string(),
            cwd.or_else(|| Some(self.default_cwd.clone())),
            timeout_sec,
            from,
        );

        (IngestOutcome::Enqueued, Some(task))
    }
}

fn log_drop(outcome: &IngestOutcome) {
    match outcome {
        IngestOutcome::DroppedUnknownSender => {
            info!("kind=POLICY_REJECT reason=UNKNOWN_SENDER component=email_source")
        }
        IngestOutcome::DroppedBadSubject => {
            info!("kind=MALFORMED reason=SUBJECT_PREFIX_MISMATCH component=email_source")
        }
        IngestOutcome::DroppedEmptyBody => {
            info!("kind=MALFORMED reason=EMPTY_BODY component=email_source")
        }
        IngestOutcome::Enqueued => unreachable!(),
    }
}

/// Minimal tag-stripping fallback for HTML-only bodies. Not a full HTML
/// parser: good enough to recover plain text for command extraction, which
/// is all C3 needs it for.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn source() -> EmailSource {
        let mut allowed = HashSet::new();
        allowed.insert("alice@example.com".to_string());
        EmailSource::new(
            EmailConfig {
                imap_host: "imap.example.com".into(),
                imap_port: 993,
                smtp_host: "smtp.example.com".into(),
                smtp_port: 587,
                address: "daemon@example.com".into(),
                encrypted_password: "x".into(),
                imap_folder: "INBOX".into(),
            },
            "password".into(),
            allowed,
            "/home/dev/project".into(),
        )
    }

    fn raw_message(from: &str, subject: &str, body: &str) -> Vec<u8> {
        format!(
            "From: {from}\r\nTo: daemon@example.com\r\nSubject: {subject}\r\nContent-Type: text/plain\r\n\r\n{body}"
        )
        .into_bytes()
    }

    #[test]
    fn ingests_a_well_formed_command() {
        let src = source();
        let raw = raw_message("alice@example.com", "[CCJK] hello", "echo hi\n");
        let (outcome, task) = src.ingest(&raw);
        assert_eq!(outcome, IngestOutcome::Enqueued);
        let task = task.unwrap();
        assert_eq!(task.command, "echo hi");
        assert_eq!(task.originator, "alice@example.com");
    }

    #[test]
    fn drops_unknown_sender() {
        let src = source();
        let raw = raw_message("mallory@example.com", "[CCJK] x", "echo boom");
        let (outcome, task) = src.ingest(&raw);
        assert_eq!(outcome, IngestOutcome::DroppedUnknownSender);
        assert!(task.is_none());
    }

    #[test]
    fn drops_messages_without_the_subject_prefix() {
        let src = source();
        let raw = raw_message("alice@example.com", "hello there", "echo hi");
        let (outcome, task) = src.ingest(&raw);
        assert_eq!(outcome, IngestOutcome::DroppedBadSubject);
        assert!(task.is_none());
    }

    #[test]
    fn parses_cwd_and_timeout_directives() {
        let src = source();
        let raw = raw_message(
            "alice@example.com",
            "[CCJK] build",
            "npm run build\ncwd: /home/dev/other\ntimeout: 45\n",
        );
        let (_, task) = src.ingest(&raw);
        let task = task.unwrap();
        assert_eq!(task.command, "npm run build");
        assert_eq!(task.cwd.as_deref(), Some("/home/dev/other"));
        assert_eq!(task.timeout_sec, Some(45));
    }

    #[test]
    fn falls_back_to_project_path_when_no_cwd_directive() {
        let src = source();
        let raw = raw_message("alice@example.com", "[CCJK] t", "git status\n");
        let (_, task) = src.ingest(&raw);
        let task = task.unwrap();
        assert_eq!(task.cwd.as_deref(), Some("/home/dev/project"));
    }

    #[test]
    fn strip_html_recovers_plain_text() {
        assert_eq!(strip_html("<p>echo <b>hi</b></p>"), "echo hi");
    }

    #[test]
    fn is_auth_error_recognizes_login_rejection_marker() {
        let login_err = anyhow::anyhow!("imap-auth-rejected: IMAP login failed: No");
        assert!(EmailSource::is_auth_error(&login_err));

        let network_err = anyhow::anyhow!("failed to connect to imap.example.com:993");
        assert!(!EmailSource::is_auth_error(&network_err));
    }
}
