/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: lock.rs
 *
 * Single-instance daemon lock (C7): an OS-exclusive file lock held for the
 * process lifetime, contents = PID (informational only).
 */

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Holds the lock file handle for as long as this value is alive; dropping
/// it releases the OS lock on every exit path, including panics.
pub struct DaemonLock {
    _file: File,
    path: PathBuf,
}

impl DaemonLock {
    /// Acquire `<config_dir>/daemon.lock`. Returns an error if another
    /// process already holds it (maps to exit code 2 at the CLI boundary).
    pub fn acquire(config_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("failed to create {}", config_dir.display()))?;
        let path = config_dir.join("daemon.lock");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        file.try_lock_exclusive()
            .context("another daemon instance already holds the lock")?;

        write!(file, "{}", std::process::id()).context("failed to write PID to lock file")?;
        file.sync_all().ok();

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs2::FileExt as _;

    #[test]
    fn acquiring_twice_in_the_same_process_fails_the_second_time() {
        let dir = tempfile::tempdir().unwrap();
        let first = DaemonLock::acquire(dir.path()).unwrap();

        let second_attempt = File::options()
            .write(true)
            .open(first.path())
            .unwrap()
            .try_lock_exclusive();
        assert!(second_attempt.is_err());
    }

    #[test]
    fn lock_file_contains_the_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DaemonLock::acquire(dir.path()).unwrap();
        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn dropping_the_lock_releases_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        {
            let _lock = DaemonLock::acquire(&path).unwrap();
        }
        let reacquired = DaemonLock::acquire(&path);
        assert!(reacquired.is_ok());
    }
}
