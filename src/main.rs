/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: main.rs
 */

mod cli;
mod cloud;
mod config;
mod crypto;
mod email_sink;
mod email_source;
mod executor;
mod lock;
mod logging;
mod orchestrator;
mod security;
mod task;

use clap::Parser;
use cli::{Cli, Command};
use cloud::CloudClient;
use config::DaemonConfig;
use email_sink::EmailSink;
use email_source::EmailSource;
use lock::DaemonLock;
use log::{error, info, warn};
use orchestrator::Orchestrator;
use rustls::crypto as rustls_crypto;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::signal;

fn credentials_key_path() -> anyhow::Result<std::path::PathBuf> {
    Ok(config::config_dir()?.join("credentials").join("key"))
}

async fn run_start(config_path: Option<String>) -> i32 {
    let path = match config_path
        .map(std::path::PathBuf::from)
        .map(Ok)
        .unwrap_or_else(DaemonConfig::default_path)
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to resolve config path: {e}");
            return cli::exit_code::CONFIG_ERROR;
        }
    };

    let config = match DaemonConfig::load_from(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", path.display());
            return cli::exit_code::CONFIG_ERROR;
        }
    };

    if let Err(e) = logging::initialize_logger(&config) {
        eprintln!("Failed to initialize logger: {e}");
        return cli::exit_code::CONFIG_ERROR;
    }

    info!("Starting ccjk daemon in {:?} mode", config.mode);

    let config_dir = match config::config_dir() {
        Ok(d) => d,
        Err(e) => {
            error!("{e}");
            return cli::exit_code::CONFIG_ERROR;
        }
    };

    let _lock = match DaemonLock::acquire(&config_dir) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to acquire daemon lock: {e}");
            return cli::exit_code::LOCK_HELD;
        }
    };

    let key_path = match credentials_key_path() {
        Ok(p) => p,
        Err(e) => {
            error!("{e}");
            return cli::exit_code::CONFIG_ERROR;
        }
    };
    let key = match crypto::load_or_create_key(&key_path) {
        Ok(k) => k,
        Err(e) => {
            error!("failed to load credentials key: {e}");
            return cli::exit_code::CONFIG_ERROR;
        }
    };

    let (email_source, email_sink) = match &config.email {
        Some(email_cfg) => {
            let password = match crypto::decrypt(&key, &email_cfg.encrypted_password) {
                Ok(p) => p,
                Err(e) => {
                    error!("failed to decrypt email password: {e}");
                    return cli::exit_code::CONFIG_ERROR;
                }
            };
            let source = EmailSource::new(
                email_cfg.clone(),
                password.clone(),
                config.allowed_senders.clone(),
                config.project_path.clone(),
            );
            let sink = Arc::new(EmailSink::new(email_cfg.clone(), password));
            (Some(source), Some(sink))
        }
        None => (None, None),
    };

    let cloud = match &config.cloud {
        Some(cloud_cfg) => {
            let account_credentials = match &cloud_cfg.encrypted_account_password {
                Some(encrypted) => match crypto::decrypt(&key, encrypted) {
                    Ok(password) => cloud_cfg.account_email.clone().map(|email| (email, password)),
                    Err(e) => {
                        error!("failed to decrypt cloud account password: {e}");
                        return cli::exit_code::CONFIG_ERROR;
                    }
                },
                None => None,
            };

            let client = Arc::new(CloudClient::new(
                cloud_cfg.api_base_url.clone(),
                cloud_cfg.device_key.clone(),
                account_credentials.clone(),
            ));

            if client.device_key().await.is_none() {
                let Some((email, password)) = &account_credentials else {
                    eprintln!("cloud mode has no device_key and no account credentials to register with; re-run `daemon setup`");
                    return cli::exit_code::CONFIG_ERROR;
                };
                match client.register(email, password).await {
                    Ok(device_key) => {
                        info!("registered with cloud control plane, device_key acquired");
                        let mut persisted = config.clone();
                        if let Some(cloud_cfg) = persisted.cloud.as_mut() {
                            cloud_cfg.device_key = Some(device_key);
                        }
                        if let Err(e) = persisted.save_to(&path) {
                            warn!("failed to persist cloud device_key to {}: {e}", path.display());
                        }
                    }
                    Err(e) => {
                        error!("cloud registration failed: {e}");
                        return cli::exit_code::CONFIG_ERROR;
                    }
                }
            }

            Some(client)
        }
        None => None,
    };

    let orchestrator = Arc::new(Orchestrator::new(config.clone(), email_source, email_sink, cloud.clone()));
    let shutdown_tx = orchestrator.shutdown_handle();

    let run_handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping control loops");
    let _ = shutdown_tx.send(());

    if let Err(e) = run_handle.await {
        error!("orchestrator task panicked: {e}");
        return cli::exit_code::RUNTIME_ERROR;
    }

    if let Some(cloud) = &cloud {
        let _ = cloud.mark_offline().await;
    }

    info!("daemon stopped cleanly");
    cli::exit_code::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

fn run_stop(config_path: Option<String>) -> i32 {
    let dir = match config_path
        .map(|p| std::path::PathBuf::from(p).parent().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| config::config_dir().ok())
    {
        Some(d) => d,
        None => {
            eprintln!("could not resolve config directory");
            return cli::exit_code::CONFIG_ERROR;
        }
    };

    let lock_path = dir.join("daemon.lock");
    let pid = match std::fs::read_to_string(&lock_path) {
        Ok(s) => s.trim().to_string(),
        Err(e) => {
            eprintln!("no daemon lock file at {}: {e}", lock_path.display());
            return cli::exit_code::RUNTIME_ERROR;
        }
    };

    #[cfg(unix)]
    {
        let pid: i32 = match pid.parse() {
            Ok(p) => p,
            Err(_) => {
                eprintln!("lock file does not contain a valid PID");
                return cli::exit_code::RUNTIME_ERROR;
            }
        };
        unsafe {
            if libc::kill(pid, libc::SIGTERM) != 0 {
                eprintln!("failed to signal pid {pid}");
                return cli::exit_code::RUNTIME_ERROR;
            }
        }
        println!("sent SIGTERM to daemon (pid {pid})");
    }
    #[cfg(not(unix))]
    {
        println!("stop is only implemented on unix targets (pid {pid})");
    }

    cli::exit_code::SUCCESS
}

fn run_status(config_path: Option<String>) -> i32 {
    let dir = match config_path
        .map(|p| std::path::PathBuf::from(p).parent().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| config::config_dir().ok())
    {
        Some(d) => d,
        None => {
            eprintln!("could not resolve config directory");
            return cli::exit_code::CONFIG_ERROR;
        }
    };

    let lock_path = dir.join("daemon.lock");
    match std::fs::read_to_string(&lock_path) {
        Ok(pid) => println!("daemon: running (pid {})", pid.trim()),
        Err(_) => println!("daemon: not running"),
    }

    let status_path = dir.join("daemon.status.json");
    match std::fs::read_to_string(&status_path) {
        Ok(contents) => match serde_json::from_str::<orchestrator::StatusSnapshot>(&contents) {
            Ok(snapshot) => {
                println!("mode: {:?}", snapshot.mode);
                println!("uptime: {}s", snapshot.uptime_secs);
                println!("running: {}", snapshot.running);
                println!(
                    "last heartbeat: {}",
                    snapshot
                        .last_heartbeat_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
                for line in &snapshot.components {
                    println!("{line}");
                }
            }
            Err(e) => println!("status: degraded:malformed snapshot ({e})"),
        },
        Err(_) => println!("status: unavailable (daemon has not written a status snapshot yet)"),
    }

    cli::exit_code::SUCCESS
}

fn run_logs(config_path: Option<String>, lines: usize) -> i32 {
    let dir = match config_path
        .map(|p| std::path::PathBuf::from(p).parent().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| config::config_dir().ok())
    {
        Some(d) => d,
        None => {
            eprintln!("could not resolve config directory");
            return cli::exit_code::CONFIG_ERROR;
        }
    };

    let log_path = dir.join("daemon.log");
    let mut contents = String::new();
    match std::fs::File::open(&log_path).and_then(|mut f| f.read_to_string(&mut contents)) {
        Ok(_) => {
            let tail: Vec<&str> = contents.lines().rev().take(lines).collect();
            for line in tail.into_iter().rev() {
                println!("{line}");
            }
            cli::exit_code::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to read {}: {e}", log_path.display());
            cli::exit_code::RUNTIME_ERROR
        }
    }
}

fn run_setup(config_path: Option<String>) -> i32 {
    print!("Daemon mode [email/cloud/hybrid] (default: email): ");
    let _ = std::io::stdout().flush();
    let mode = read_line_default("email");

    let mut allowed_senders = std::collections::HashSet::new();
    print!("Project path (default cwd for tasks): ");
    let _ = std::io::stdout().flush();
    let project_path = read_line_default(".");

    print!("Allowed sender email addresses (comma-separated): ");
    let _ = std::io::stdout().flush();
    for addr in read_line_default("").split(',') {
        let addr = addr.trim();
        if !addr.is_empty() {
            allowed_senders.insert(addr.to_string());
        }
    }

    let email = if mode == "email" || mode == "hybrid" {
        print!("IMAP host: ");
        let _ = std::io::stdout().flush();
        let imap_host = read_line_default("");
        print!("SMTP host: ");
        let _ = std::io::stdout().flush();
        let smtp_host = read_line_default("");
        print!("Daemon mailbox address: ");
        let _ = std::io::stdout().flush();
        let address = read_line_default("");
        let password = rpassword::prompt_password("Mailbox password: ").unwrap_or_default();

        let key_path = match credentials_key_path() {
            Ok(p) => p,
            Err(e) => {
                eprintln!("{e}");
                return cli::exit_code::CONFIG_ERROR;
            }
        };
        let key = match crypto::load_or_create_key(&key_path) {
            Ok(k) => k,
            Err(e) => {
                eprintln!("failed to initialize credentials key: {e}");
                return cli::exit_code::CONFIG_ERROR;
            }
        };
        let encrypted_password = match crypto::encrypt(&key, &password) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("failed to encrypt password: {e}");
                return cli::exit_code::CONFIG_ERROR;
            }
        };

        Some(config::EmailConfig {
            imap_host,
            imap_port: 993,
            smtp_host,
            smtp_port: 587,
            address,
            encrypted_password,
            imap_folder: "INBOX".to_string(),
        })
    } else {
        None
    };

    let cloud = if mode == "cloud" || mode == "hybrid" {
        print!("Cloud API base URL: ");
        let _ = std::io::stdout().flush();
        let api_base_url = read_line_default("");
        print!("Cloud account email: ");
        let _ = std::io::stdout().flush();
        let account_email = read_line_default("");
        let account_password = rpassword::prompt_password("Cloud account password: ").unwrap_or_default();

        let key_path = match credentials_key_path() {
            Ok(p) => p,
            Err(e) => {
                eprintln!("{e}");
                return cli::exit_code::CONFIG_ERROR;
            }
        };
        let key = match crypto::load_or_create_key(&key_path) {
            Ok(k) => k,
            Err(e) => {
                eprintln!("failed to initialize credentials key: {e}");
                return cli::exit_code::CONFIG_ERROR;
            }
        };
        let encrypted_account_password = match crypto::encrypt(&key, &account_password) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("failed to encrypt cloud account password: {e}");
                return cli::exit_code::CONFIG_ERROR;
            }
        };

        Some(config::CloudConfig {
            api_base_url,
            device_key: None,
            account_email: Some(account_email),
            encrypted_account_password: Some(encrypted_account_password),
        })
    } else {
        None
    };

    let daemon_mode = match mode.as_str() {
        "cloud" => config::DaemonMode::Cloud,
        "hybrid" => config::DaemonMode::Hybrid,
        _ => config::DaemonMode::Email,
    };

    let cfg = DaemonConfig {
        mode: daemon_mode,
        email,
        cloud,
        allowed_senders,
        command_allow_prefixes: Vec::new(),
        command_deny_substrings: security::SecurityPolicy::default_deny_substrings(),
        max_command_length: config::DEFAULT_MAX_COMMAND_LENGTH,
        project_path,
        check_interval_sec: config::DEFAULT_CHECK_INTERVAL_SECONDS,
        task_timeout_sec: config::DEFAULT_TASK_TIMEOUT_SECONDS,
        heartbeat_interval_sec: config::DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
        max_concurrent_tasks: config::DEFAULT_MAX_CONCURRENT_TASKS,
        log_file: None,
        log_level: None,
        quiet: false,
    };

    if let Err(e) = cfg.validate() {
        eprintln!("invalid configuration: {e}");
        return cli::exit_code::CONFIG_ERROR;
    }

    let path = match config_path
        .map(std::path::PathBuf::from)
        .map(Ok)
        .unwrap_or_else(DaemonConfig::default_path)
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            return cli::exit_code::CONFIG_ERROR;
        }
    };

    match cfg.save_to(&path) {
        Ok(()) => {
            println!("config written to {}", path.display());
            cli::exit_code::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to save config: {e}");
            cli::exit_code::CONFIG_ERROR
        }
    }
}

fn read_line_default(default: &str) -> String {
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return default.to_string();
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}

#[tokio::main]
async fn main() {
    let _ = rustls_crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    let code = match cli.command {
        Command::Setup => run_setup(cli.config),
        Command::Start => run_start(cli.config).await,
        Command::Stop => run_stop(cli.config),
        Command::Status => run_status(cli.config),
        Command::Logs { lines } => run_logs(cli.config, lines),
    };

    std::process::exit(code);
}
