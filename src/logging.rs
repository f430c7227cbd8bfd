/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: logging.rs
 *
 * Logger initialization: level from config, else `RUST_LOG`, else Info;
 * records are emitted as line-delimited JSON; `quiet` silences stderr; an
 * optional log file is tee'd alongside stderr via `MultiWriter`, wrapped in
 * a `RotatingWriter` that renames the file at a 10 MiB threshold, keeping
 * the last 5 backups.
 */

use crate::config::DaemonConfig;
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// One line-delimited JSON log record: `{ts, level, component, message}`.
/// `component` is the emitting module path (`record.target()`), which is
/// what every `info!`/`warn!`/`error!` call site already carries for free.
fn write_json_record(buf: &mut env_logger::fmt::Formatter, record: &log::Record) -> io::Result<()> {
    let record_json = serde_json::json!({
        "ts": chrono::Utc::now().to_rfc3339(),
        "level": record.level().to_string(),
        "component": record.target(),
        "message": record.args().to_string(),
    });
    writeln!(buf, "{record_json}")
}

const ROTATE_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;
const MAX_BACKUPS: u32 = 5;

struct MultiWriter {
    writers: Vec<Box<dyn Write + Send + 'static>>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for w in &mut self.writers {
            let _ = w.write(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for w in &mut self.writers {
            let _ = w.flush();
        }
        Ok(())
    }
}

/// A `Write` sink over a path that rotates the underlying file once it
/// crosses [`ROTATE_THRESHOLD_BYTES`], shifting `daemon.log.1`..`.4` up to
/// `.2`..`.5` and dropping anything past `.5`.
struct RotatingWriter {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RotatingWriter {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self { path, file, written })
    }

    fn rotate(&mut self) -> io::Result<()> {
        for n in (1..MAX_BACKUPS).rev() {
            let from = backup_path(&self.path, n);
            let to = backup_path(&self.path, n + 1);
            if from.exists() {
                let _ = fs::rename(&from, &to);
            }
        }
        let first_backup = backup_path(&self.path, 1);
        fs::rename(&self.path, &first_backup)?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn backup_path(base: &Path, n: u32) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(format!(".{n}"));
    PathBuf::from(s)
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written >= ROTATE_THRESHOLD_BYTES {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Level resolution order is config, then `RUST_LOG`, then `Info`; file
/// target tees to stderr unless `quiet` is set.
pub fn initialize_logger(config: &DaemonConfig) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.format(write_json_record);

    if let Some(level) = &config.log_level {
        builder.parse_filters(level);
    } else if let Ok(env_level) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env_level);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }

    if let Some(log_file) = &config.log_file {
        let rotator = RotatingWriter::open(PathBuf::from(log_file))
            .with_context(|| format!("failed to open log file {log_file}"))?;

        if config.quiet {
            builder.target(env_logger::Target::Pipe(Box::new(rotator)));
        } else {
            let multi_writer = MultiWriter {
                writers: vec![Box::new(rotator), Box::new(io::stderr())],
            };
            builder.target(env_logger::Target::Pipe(Box::new(multi_writer)));
        }
    } else if config.quiet {
        builder.target(env_logger::Target::Pipe(Box::new(io::sink())));
    }

    builder.init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_when_threshold_is_crossed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let mut writer = RotatingWriter::open(path.clone()).unwrap();
        writer.written = ROTATE_THRESHOLD_BYTES;
        writer.write_all(b"first line after rotation\n").unwrap();

        assert!(backup_path(&path, 1).exists());
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first line after rotation\n");
    }

    #[test]
    fn keeps_only_the_last_five_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let mut writer = RotatingWriter::open(path.clone()).unwrap();

        for i in 0..7 {
            writer.written = ROTATE_THRESHOLD_BYTES;
            writer.write_all(format!("line {i}\n").as_bytes()).unwrap();
        }

        assert!(backup_path(&path, 5).exists());
        assert!(!backup_path(&path, 6).exists());
    }
}
