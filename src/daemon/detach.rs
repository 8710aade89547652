//! Process supervision primitive: detach the calling process into a daemon.
//!
//! Classic double-fork: first fork and parent exit, `setsid` to shed the
//! controlling terminal, second fork so the worker is not a session leader,
//! permissive umask, chdir to a stable working directory, stdio redirected
//! to configured paths, and every descriptor above stderr closed up to the
//! soft fd limit (minus an explicit retain list).
//!
//! `fork()` is the one unsafe call in the crate. It must run while the
//! process is still single-threaded; the CLI calls `detach` before any
//! logger or registry is built, so only the main thread exists.

use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::core::errors::{CrawlerError, Result};

/// Where the detached process points its feet and its stdio.
#[derive(Debug, Clone)]
pub struct DetachConfig {
    /// Working directory after detach.
    pub workdir: PathBuf,
    /// Path opened read-only onto fd 0.
    pub stdin: PathBuf,
    /// Path opened append-create onto fd 1.
    pub stdout: PathBuf,
    /// Path opened append-create onto fd 2.
    pub stderr: PathBuf,
    /// Descriptors above 2 to leave open.
    pub keep_fds: Vec<RawFd>,
}

impl Default for DetachConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("/"),
            stdin: PathBuf::from("/dev/null"),
            stdout: PathBuf::from("/dev/null"),
            stderr: PathBuf::from("/dev/null"),
            keep_fds: Vec::new(),
        }
    }
}

/// Upper bound on the descriptor-close sweep; some hosts report soft
/// limits in the millions and iterating them is pure waste.
const FD_SWEEP_CAP: RawFd = 4096;

/// Detach the calling process. On return the caller is the daemonized
/// grandchild; the intermediate processes have already exited.
///
/// Fork failure is fatal for the caller and is reported on the original
/// stderr, which is still attached at that point.
#[cfg(unix)]
#[allow(unsafe_code)] // fork() requires unsafe
pub fn detach(config: &DetachConfig) -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // SAFETY: the CLI invokes detach before spawning any thread, so the
    // process is single-threaded and fork() is well-defined. The parent
    // exits immediately; only the child proceeds.
    match unsafe { fork() }.map_err(detach_err("first fork"))? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    // New session: session leader with no controlling terminal.
    setsid().map_err(detach_err("setsid"))?;

    // SAFETY: still single-threaded; we are the first fork's child and no
    // runtime or thread has been started. The second fork guarantees the
    // worker is not a session leader and cannot reacquire a terminal.
    match unsafe { fork() }.map_err(detach_err("second fork"))? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    nix::sys::stat::umask(nix::sys::stat::Mode::empty());
    std::env::set_current_dir(&config.workdir)
        .map_err(|e| CrawlerError::io(&config.workdir, e))?;

    redirect_stdio(config)?;
    close_high_fds(&config.keep_fds);
    Ok(())
}

/// Non-unix targets cannot detach; the same scheduler loop still runs
/// under `--foreground`.
#[cfg(not(unix))]
pub fn detach(_config: &DetachConfig) -> Result<()> {
    Err(CrawlerError::Detach {
        details: "detach is unsupported on this platform; run with --foreground".to_string(),
    })
}

#[cfg(unix)]
fn redirect_stdio(config: &DetachConfig) -> Result<()> {
    use std::os::fd::IntoRawFd;

    use nix::unistd::{close, dup2};

    let stdin = std::fs::File::open(&config.stdin)
        .map_err(|e| CrawlerError::io(&config.stdin, e))?;
    let stdout = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.stdout)
        .map_err(|e| CrawlerError::io(&config.stdout, e))?;
    let stderr = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.stderr)
        .map_err(|e| CrawlerError::io(&config.stderr, e))?;

    // Flush before the streams are swapped out from under std.
    use std::io::Write as _;
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    for (file, target) in [(stdin, 0), (stdout, 1), (stderr, 2)] {
        let fd = file.into_raw_fd();
        dup2(fd, target).map_err(detach_err("dup2"))?;
        if fd > 2 {
            let _ = close(fd);
        }
    }
    Ok(())
}

/// Close every descriptor in (2, limit], sparing the retain list. Errors
/// are ignored: most of the range was never open.
#[cfg(unix)]
fn close_high_fds(keep: &[RawFd]) {
    use nix::sys::resource::{getrlimit, Resource};

    let limit = getrlimit(Resource::RLIMIT_NOFILE)
        .map_or(FD_SWEEP_CAP as u64, |(soft, _hard)| soft)
        .min(FD_SWEEP_CAP as u64);
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let limit = limit as RawFd;
    for fd in 3..=limit {
        if keep.contains(&fd) {
            continue;
        }
        let _ = nix::unistd::close(fd);
    }
}

#[cfg(unix)]
fn detach_err<E: std::fmt::Display>(stage: &'static str) -> impl Fn(E) -> CrawlerError {
    move |e| CrawlerError::Detach {
        details: format!("{stage}: {e}"),
    }
}
