//! Pid registry: one file per live daemon instance in a shared directory.
//!
//! A record is named by its pid and holds `"<context> <exit_path>\n"`.
//! Liveness is the intersection of "record exists" and "pid answers
//! `kill(pid, 0)`". Clean shutdown renames the record to `.DEFUNCT` rather
//! than deleting it, closing the race where "no pidfile" is misread as
//! "context free" before the OS has reaped the process-table entry.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::{CrawlerError, Result};

/// Suffix marking an archived (cleanly exited) record.
pub const DEFUNCT_SUFFIX: &str = ".DEFUNCT";

/// Forced-stop polling cadence and budget.
const STOP_POLL: Duration = Duration::from_millis(100);
const STOP_ATTEMPTS: u32 = 100;

/// One live instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRecord {
    /// Owning process.
    pub pid: u32,
    /// Context the instance claimed.
    pub context: String,
    /// Where the instance polls for its stop signal.
    pub exit_path: PathBuf,
}

/// Registry directory handle.
#[derive(Debug, Clone)]
pub struct PidRegistry {
    dir: PathBuf,
}

impl PidRegistry {
    /// Registry rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Registry directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record path for a pid.
    #[must_use]
    pub fn record_path(&self, pid: u32) -> PathBuf {
        self.dir.join(pid.to_string())
    }

    /// Claim `context` for the calling process.
    ///
    /// Creates the registry directory on first use; refuses if another live
    /// record already holds the context. The record itself is created with
    /// `create_new` so two racing registrants cannot both win on one pid.
    pub fn register(&self, context: &str, exit_path: &Path) -> Result<ArchiveGuard> {
        std::fs::create_dir_all(&self.dir).map_err(|e| CrawlerError::io(&self.dir, e))?;
        if let Some(live) = self.find_live(context)? {
            return Err(CrawlerError::ContextBusy {
                context: context.to_string(),
                pid: live.pid,
            });
        }

        let pid = std::process::id();
        let path = self.record_path(pid);
        // A leftover record under our own pid can only belong to a dead
        // process (pid reuse); clear it before the exclusive create.
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| CrawlerError::io(&path, e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| CrawlerError::io(&path, e))?;
        writeln!(file, "{} {}", context, exit_path.display())
            .map_err(|e| CrawlerError::io(&path, e))?;

        Ok(ArchiveGuard { path })
    }

    /// All records whose pid is actually alive, sorted by pid. Defunct and
    /// stale entries fall out naturally because the liveness check fails.
    pub fn list_live(&self) -> Result<Vec<PidRecord>> {
        let mut live = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(live),
            Err(e) => return Err(CrawlerError::io(&self.dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| CrawlerError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(pid) = name.parse::<u32>() else {
                // .DEFUNCT archives and foreign files are not records.
                continue;
            };
            if !process_alive(pid) {
                continue;
            }
            let raw = match std::fs::read_to_string(entry.path()) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let line = raw.trim_end();
            let Some((context, exit_path)) = line.split_once(' ') else {
                continue;
            };
            live.push(PidRecord {
                pid,
                context: context.to_string(),
                exit_path: PathBuf::from(exit_path),
            });
        }
        live.sort_by_key(|r| r.pid);
        Ok(live)
    }

    /// The live record holding `context`, if any.
    pub fn find_live(&self, context: &str) -> Result<Option<PidRecord>> {
        Ok(self
            .list_live()?
            .into_iter()
            .find(|r| r.context == context))
    }

    /// Rename a record to its `.DEFUNCT` archive. Missing records are fine
    /// (idempotent).
    pub fn archive(&self, pid: u32) -> Result<()> {
        let path = self.record_path(pid);
        match std::fs::rename(&path, defunct_path(&path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CrawlerError::io(&path, e)),
        }
    }

    /// Forced stop: repeat SIGTERM and poll until the process table reports
    /// the pid gone, then archive its record. Best-effort and bounded.
    #[cfg(unix)]
    pub fn terminate(&self, pid: u32) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let target = Pid::from_raw(
            i32::try_from(pid).map_err(|_| CrawlerError::Runtime {
                details: format!("pid out of range: {pid}"),
            })?,
        );
        for _ in 0..STOP_ATTEMPTS {
            if !process_alive(pid) {
                return self.archive(pid);
            }
            // ESRCH between the check and the signal means it just died.
            let _ = kill(target, Signal::SIGTERM);
            std::thread::sleep(STOP_POLL);
        }
        if process_alive(pid) {
            return Err(CrawlerError::StopTimeout { pid });
        }
        self.archive(pid)
    }
}

/// Archives the record on drop, so every daemon exit path (including a
/// panic unwinding out of the scheduler loop) leaves a `.DEFUNCT` file
/// behind instead of a live-looking record.
#[derive(Debug)]
pub struct ArchiveGuard {
    path: PathBuf,
}

impl ArchiveGuard {
    /// Path of the record being guarded.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArchiveGuard {
    fn drop(&mut self) {
        let _ = std::fs::rename(&self.path, defunct_path(&self.path));
    }
}

fn defunct_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(DEFUNCT_SUFFIX);
    PathBuf::from(name)
}

/// Process-table liveness via the null signal.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    i32::try_from(pid).is_ok_and(|raw| kill(Pid::from_raw(raw), None).is_ok())
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}
