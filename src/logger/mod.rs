//! JSONL append-only logging with graceful degradation.
//!
//! One JSON object per line: `ts`, `level`, `context`, `msg`. The daemon is
//! single-threaded, but the handle is cheap to clone (shared `Arc` inner, the
//! writer behind a `parking_lot` mutex) so the scheduler loop, breaker, and
//! registry can all carry one. A failed append degrades to stderr rather
//! than killing the daemon.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::errors::{CrawlerError, Result};

/// Log severities, lowercase in the serialized line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Serialized shape of one log line.
#[derive(Serialize)]
struct Record<'a> {
    ts: String,
    level: &'static str,
    context: &'a str,
    msg: &'a str,
}

#[derive(Debug)]
struct Inner {
    sink: Mutex<Option<File>>,
    path: Option<PathBuf>,
    context: String,
    echo: bool,
}

/// Cloneable logging handle.
#[derive(Debug, Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

impl Logger {
    /// Open (append-create) a JSONL log at `path` for daemon `context`.
    pub fn open(path: impl AsRef<Path>, context: &str) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CrawlerError::io(parent, e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CrawlerError::io(path, e))?;
        Ok(Self {
            inner: Arc::new(Inner {
                sink: Mutex::new(Some(file)),
                path: Some(path.to_path_buf()),
                context: context.to_string(),
                echo: false,
            }),
        })
    }

    /// Logger for foreground commands: stderr only, no file.
    #[must_use]
    pub fn stderr_only(context: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink: Mutex::new(None),
                path: None,
                context: context.to_string(),
                echo: true,
            }),
        }
    }

    /// Path of the log file, when one is open.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Raw descriptor of the open sink, for retain lists around fd sweeps.
    #[cfg(unix)]
    #[must_use]
    pub fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd as _;
        self.inner.sink.lock().as_ref().map(|f| f.as_raw_fd())
    }

    /// Append an info line.
    pub fn info(&self, msg: &str) {
        self.emit(Level::Info, msg);
    }

    /// Append a warning line.
    pub fn warn(&self, msg: &str) {
        self.emit(Level::Warn, msg);
    }

    /// Append an error line.
    pub fn error(&self, msg: &str) {
        self.emit(Level::Error, msg);
    }

    fn emit(&self, level: Level, msg: &str) {
        let record = Record {
            ts: chrono::Utc::now().to_rfc3339(),
            level: level.as_str(),
            context: &self.inner.context,
            msg,
        };
        let Ok(line) = serde_json::to_string(&record) else {
            eprintln!("[{}] {}: {msg}", record.ts, record.level);
            return;
        };

        let mut degraded = false;
        if let Some(file) = self.inner.sink.lock().as_mut() {
            if writeln!(file, "{line}").is_err() {
                degraded = true;
            }
        }
        if degraded || self.inner.echo {
            eprintln!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log/crawler.jsonl");
        let logger = Logger::open(&path, "TEST").unwrap();
        logger.info("first");
        logger.error("second");

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["level"], "info");
        assert_eq!(first["context"], "TEST");
        assert_eq!(first["msg"], "first");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["level"], "error");
    }

    #[test]
    fn clones_share_the_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawler.jsonl");
        let logger = Logger::open(&path, "TEST").unwrap();
        let clone = logger.clone();
        logger.info("a");
        clone.info("b");
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }
}
