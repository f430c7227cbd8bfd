/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: config.rs
 */

use anyhow::{Context, Result};
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::security::SecurityPolicy;

pub const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_TASK_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 1;
pub const DEFAULT_MAX_COMMAND_LENGTH: usize = 4096;

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECONDS
}

fn default_task_timeout() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECONDS
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECONDS
}

fn default_max_concurrent_tasks() -> usize {
    DEFAULT_MAX_CONCURRENT_TASKS
}

fn default_max_command_length() -> usize {
    DEFAULT_MAX_COMMAND_LENGTH
}

fn default_imap_folder() -> String {
    "INBOX".to_string()
}

/// Which Source(s) the daemon actively polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonMode {
    Email,
    Cloud,
    Hybrid,
}

impl DaemonMode {
    pub fn uses_email(self) -> bool {
        matches!(self, DaemonMode::Email | DaemonMode::Hybrid)
    }

    pub fn uses_cloud(self) -> bool {
        matches!(self, DaemonMode::Cloud | DaemonMode::Hybrid)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub address: String,
    /// Output of [`crate::crypto::encrypt`], never the plaintext password.
    pub encrypted_password: String,
    #[serde(default = "default_imap_folder")]
    pub imap_folder: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudConfig {
    pub api_base_url: String,
    #[serde(default)]
    pub device_key: Option<String>,
    /// Account credentials used for `POST /auth` when `device_key` is absent
    /// or the cloud rejects it with 401. Absent means the daemon cannot
    /// self-register and a missing/expired `device_key` is fatal to cloud
    /// mode until an operator re-runs `daemon setup`.
    #[serde(default)]
    pub account_email: Option<String>,
    /// Output of [`crate::crypto::encrypt`], never the plaintext password.
    #[serde(default)]
    pub encrypted_account_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub mode: DaemonMode,
    #[serde(default)]
    pub email: Option<EmailConfig>,
    #[serde(default)]
    pub cloud: Option<CloudConfig>,
    #[serde(default)]
    pub allowed_senders: HashSet<String>,
    #[serde(default)]
    pub command_allow_prefixes: Vec<String>,
    #[serde(default = "SecurityPolicy::default_deny_substrings")]
    pub command_deny_substrings: Vec<String>,
    #[serde(default = "default_max_command_length")]
    pub max_command_length: usize,
    pub project_path: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_sec: u64,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_sec: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_sec: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub quiet: bool,
}

impl DaemonConfig {
    /// Load from the config file, then overlay `CCJK__`-prefixed environment
    /// variables.
    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let cfg: DaemonConfig = Config::builder()
            .add_source(File::from(path).required(true))
            .add_source(config::Environment::with_prefix("CCJK").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks < 1 {
            anyhow::bail!("max_concurrent_tasks must be >= 1");
        }
        if self.mode.uses_email() && self.email.is_none() {
            anyhow::bail!("mode {:?} requires an [email] section", self.mode);
        }
        if self.mode.uses_cloud() && self.cloud.is_none() {
            anyhow::bail!("mode {:?} requires a [cloud] section", self.mode);
        }
        Ok(())
    }

    /// Persist this config as JSON at `path`, mode 0600.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(&file, self).context("failed to serialize config")?;
        set_owner_only(path)?;
        Ok(())
    }

    pub fn security_policy(&self) -> SecurityPolicy {
        SecurityPolicy::new(
            self.allowed_senders.iter().cloned(),
            self.command_allow_prefixes.clone(),
            self.command_deny_substrings.clone(),
            self.max_command_length,
        )
    }

    /// `<home>/.ccjk/daemon-config.json`
    pub fn default_path() -> Result<PathBuf> {
        Ok(config_dir()?.join("daemon-config.json"))
    }
}

/// `<home>/.ccjk`
pub fn config_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".ccjk"))
}

fn home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .context("HOME environment variable is not set")
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to chmod 0600 {}", path.display()))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn base_toml() -> &'static str {
        r#"
            mode = "email"
            project_path = "/home/dev/project"
            allowed_senders = ["alice@example.com"]
            command_allow_prefixes = ["echo "]

            [email]
            imap_host = "imap.example.com"
            imap_port = 993
            smtp_host = "smtp.example.com"
            smtp_port = 587
            address = "daemon@example.com"
            encrypted_password = "deadbeef"
        "#
    }

    #[test]
    fn deserializes_minimal_email_mode_config() {
        let cfg: DaemonConfig = Config::builder()
            .add_source(File::from_str(base_toml(), FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.mode, DaemonMode::Email);
        assert_eq!(cfg.check_interval_sec, DEFAULT_CHECK_INTERVAL_SECONDS);
        assert_eq!(cfg.task_timeout_sec, DEFAULT_TASK_TIMEOUT_SECONDS);
        assert_eq!(cfg.max_concurrent_tasks, DEFAULT_MAX_CONCURRENT_TASKS);
        assert!(!cfg.command_deny_substrings.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn hybrid_mode_requires_both_sections() {
        let toml = format!("{}\nmode = \"hybrid\"\n", base_toml());
        let cfg: DaemonConfig = Config::builder()
            .add_source(File::from_str(&toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_max_concurrent_tasks_is_rejected() {
        let toml = format!("{}\nmax_concurrent_tasks = 0\n", base_toml());
        let cfg: DaemonConfig = Config::builder()
            .add_source(File::from_str(&toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(cfg.validate().is_err());
    }

    #[test]
    fn security_policy_reflects_config_fields() {
        let cfg: DaemonConfig = Config::builder()
            .add_source(File::from_str(base_toml(), FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        let policy = cfg.security_policy();
        assert!(policy.decide("alice@example.com", "echo hi").is_allow());
    }
}
