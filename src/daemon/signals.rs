//! Signal wiring for the daemonized process.
//!
//! The loop's stop conditions are cooperative: the exit file, and this flag.
//! A platform supervisor (systemd, launchd) stops services with SIGTERM, so
//! the daemon must translate that into the same "stop at the next tick"
//! request the exit file produces; otherwise a supervisor stop would skip
//! pidfile archival.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::core::errors::Result;

/// Register SIGTERM/SIGINT to set `flag`.
#[cfg(all(unix, feature = "daemon"))]
pub fn register_termination(flag: &Arc<AtomicBool>) -> Result<()> {
    use crate::core::errors::CrawlerError;

    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        signal_hook::flag::register(signal, Arc::clone(flag)).map_err(|e| {
            CrawlerError::Runtime {
                details: format!("registering signal {signal}: {e}"),
            }
        })?;
    }
    Ok(())
}

/// Without the `daemon` feature (or off unix) there is nothing to wire;
/// stopping is exit-file only.
#[cfg(not(all(unix, feature = "daemon")))]
pub fn register_termination(_flag: &Arc<AtomicBool>) -> Result<()> {
    Ok(())
}
