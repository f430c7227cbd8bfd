/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: cli.rs
 *
 * CLI surface: `setup`/`start`/`stop`/`status`/`logs` subcommands. Exit
 * codes: 0 success, 1 config/credential error, 2 lock held by another
 * instance, 3 fatal runtime error.
 */

use clap::{Parser, Subcommand};

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const LOCK_HELD: i32 = 2;
    pub const RUNTIME_ERROR: i32 = 3;
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Override the default `<home>/.ccjk/daemon-config.json` path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interactive prompt that writes the daemon's config file.
    Setup,
    /// Run the daemon in the foreground until SIGINT/SIGTERM.
    Start,
    /// Signal the running daemon (holder of the lock file) to stop.
    Stop,
    /// Print mode, uptime, running count, and last heartbeat.
    Status,
    /// Tail the daemon's log file.
    Logs {
        #[arg(short, long, default_value_t = 100)]
        lines: usize,
    },
}
