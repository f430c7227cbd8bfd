/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: email_sink.rs
 *
 * Result Sink (C4): formats a terminal Task's result as a multipart
 * text+HTML email and sends it to the originator. The mockable
 * `SmtpMailer`/`SmtpMailerFactory` trait pair keeps the transport behind a
 * test seam so delivery can be verified without a live SMTP server.
 */

use crate::config::EmailConfig;
use crate::task::{Task, TaskResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{header::ContentType, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// No single SMTP send may block the result-delivery path past this.
const SMTP_SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SmtpMailer: Send + Sync {
    async fn send(&self, message: Message) -> Result<()>;
}

struct RealSmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

#[async_trait]
impl SmtpMailer for RealSmtpMailer {
    async fn send(&self, message: Message) -> Result<()> {
        tokio::time::timeout(SMTP_SEND_TIMEOUT, self.transport.send(message))
            .await
            .map_err(|_| anyhow::anyhow!("SMTP send timed out after {}s", SMTP_SEND_TIMEOUT.as_secs()))?
            .map_err(|e| anyhow::anyhow!("SMTP send failed: {e}"))?;
        Ok(())
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait SmtpMailerFactory: Send + Sync {
    fn create(&self, config: &EmailConfig, password: &str) -> Result<Box<dyn SmtpMailer>>;
}

pub struct RealSmtpMailerFactory;

impl SmtpMailerFactory for RealSmtpMailerFactory {
    fn create(&self, config: &EmailConfig, password: &str) -> Result<Box<dyn SmtpMailer>> {
        let creds = Credentials::new(config.address.clone(), password.to_string());
        let tls_params = TlsParameters::new(config.smtp_host.clone())
            .context("invalid SMTP TLS parameters")?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            .context("invalid SMTP host")?
            .port(config.smtp_port)
            .tls(Tls::Wrapper(tls_params))
            .credentials(creds)
            .build();

        Ok(Box::new(RealSmtpMailer { transport }))
    }
}

pub struct EmailSink {
    config: EmailConfig,
    password: String,
    factory: Arc<dyn SmtpMailerFactory>,
    mailer: OnceCell<Box<dyn SmtpMailer>>,
}

impl EmailSink {
    pub fn new(config: EmailConfig, password: String) -> Self {
        Self {
            config,
            password,
            factory: Arc::new(RealSmtpMailerFactory),
            mailer: OnceCell::new(),
        }
    }

    #[cfg(test)]
    pub fn new_with_factory(
        config: EmailConfig,
        password: String,
        factory: Arc<dyn SmtpMailerFactory>,
    ) -> Self {
        Self {
            config,
            password,
            factory,
            mailer: OnceCell::new(),
        }
    }

    /// Single send attempt per task. Failure is returned to the caller (the
    /// orchestrator), which logs it; there is no automatic retry.
    pub async fn send_result(&self, task: &Task, result: &TaskResult) -> Result<()> {
        let mailer = self
            .mailer
            .get_or_try_init(|| async { self.factory.create(&self.config, &self.password) })
            .await?;

        let subject = build_subject(&task.command, result);
        let message = build_message(&self.config.address, &task.originator, &subject, task, result)?;

        mailer.send(message).await
    }
}

fn build_subject(command: &str, result: &TaskResult) -> String {
    let icon = if result.is_success() { "\u{2705}" } else { "\u{274c}" };
    let snippet: String = command.chars().take(50).collect();
    format!("[CCJK] {icon} {snippet}")
}

fn build_message(
    from: &str,
    to: &str,
    subject: &str,
    task: &Task,
    result: &TaskResult,
) -> Result<Message> {
    let status = if result.is_success() { "SUCCESS" } else { status_label(task) };

    let plain = format!(
        "Status: {status}\nExit Code: {}\nDuration: {}ms\nCommand: {}\n\nStdout:\n{}\n\nStderr:\n{}\n{}",
        result.exit_code,
        result.duration_ms,
        task.command,
        result.stdout_tail,
        result.stderr_tail,
        if result.error_message.is_empty() {
            String::new()
        } else {
            format!("\nError: {}\n", result.error_message)
        }
    );

    let banner_color = if result.is_success() { "#2e7d32" } else { "#c62828" };
    let html = format!(
        "<html><body><div style=\"background:{banner_color};color:white;padding:8px\"><strong>{status}</strong></div>\
         <p><b>Exit Code:</b> {}</p><p><b>Duration:</b> {}ms</p><p><b>Command:</b> <code>{}</code></p>\
         <h4>Stdout</h4><pre>{}</pre><h4>Stderr</h4><pre>{}</pre></body></html>",
        result.exit_code,
        result.duration_ms,
        html_escape(&task.command),
        html_escape(&result.stdout_tail),
        html_escape(&result.stderr_tail),
    );

    Message::builder()
        .from(from.parse().context("invalid from address")?)
        .to(to.parse().context("invalid to address")?)
        .subject(subject)
        .multipart(
            MultiPart::alternative()
                .singlepart(SinglePart::builder().header(ContentType::TEXT_PLAIN).body(plain))
                .singlepart(SinglePart::builder().header(ContentType::TEXT_HTML).body(html)),
        )
        .context("failed to build result email")
}

fn status_label(task: &Task) -> &'static str {
    use crate::task::TaskState::*;
    match task.state {
        Failed => "FAILED",
        Timeout => "TIMEOUT",
        Rejected => "REJECTED",
        Cancelled => "CANCELLED",
        _ => "FAILED",
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{exit_code, Task, TaskState};

    fn test_config() -> EmailConfig {
        EmailConfig {
            imap_host: "imap.example.com".into(),
            imap_port: 993,
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            address: "daemon@example.com".into(),
            encrypted_password: "x".into(),
            imap_folder: "INBOX".into(),
        }
    }

    #[tokio::test]
    async fn sends_one_message_on_success() {
        let mut mock_factory = MockSmtpMailerFactory::new();
        mock_factory.expect_create().returning(|_, _| {
            let mut mock_mailer = MockSmtpMailer::new();
            mock_mailer
                .expect_send()
                .times(1)
                .withf(|message| {
                    let text = String::from_utf8_lossy(&message.formatted());
                    message.envelope().to()[0].to_string() == "alice@example.com"
                        && text.contains("Exit Code: 0")
                })
                .returning(|_| Ok(()));
            Ok(Box::new(mock_mailer))
        });

        let sink = EmailSink::new_with_factory(test_config(), "pw".into(), Arc::new(mock_factory));
        let mut task = Task::new_email("echo hi".into(), None, None, "alice@example.com".into());
        task.mark_running();
        let result = TaskResult {
            exit_code: 0,
            stdout_tail: "hi\n".into(),
            stderr_tail: String::new(),
            duration_ms: 12,
            error_message: String::new(),
        };
        task.mark_terminal(TaskState::Completed, result.clone());

        let sent = sink.send_result(&task, &result).await;
        assert!(sent.is_ok());
    }

    #[test]
    fn subject_uses_success_icon_and_command_prefix() {
        let result = TaskResult {
            exit_code: 0,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            duration_ms: 1,
            error_message: String::new(),
        };
        let subject = build_subject("echo hi", &result);
        assert!(subject.starts_with("[CCJK] \u{2705}"));
        assert!(subject.contains("echo hi"));
    }

    #[test]
    fn subject_uses_failure_icon_for_rejected_result() {
        let result = TaskResult::rejected("DENIED_SUBSTRING: rm -rf");
        assert_eq!(result.exit_code, exit_code::POLICY_REJECT);
        let subject = build_subject("rm -rf /", &result);
        assert!(subject.starts_with("[CCJK] \u{274c}"));
    }

    #[test]
    fn subject_truncates_long_commands_to_50_chars() {
        let long_cmd = "x".repeat(200);
        let result = TaskResult {
            exit_code: 0,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            duration_ms: 1,
            error_message: String::new(),
        };
        let subject = build_subject(&long_cmd, &result);
        // "[CCJK] " + icon + 50 chars
        assert!(subject.chars().count() <= "[CCJK] ".len() + 1 + 50 + 2);
    }
}
