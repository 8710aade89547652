//! The scheduler loop: a one-second polling loop that fires due plugins,
//! reloads configuration in place, heartbeats, and honors the cooperative
//! stop conventions (exit file, termination signals).
//!
//! The loop runs post-detach in the daemonized grandchild, or directly in
//! the calling process for `--foreground` and for the end-to-end tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{NaiveTime, Timelike as _};

use crate::core::config::Snapshot;
use crate::core::errors::{CrawlerError, Result};
use crate::daemon::breaker::{BreakerLimits, FailureMonitor};
use crate::daemon::pids::PidRegistry;
use crate::daemon::signals;
use crate::logger::Logger;
use crate::mail::Mailer;
use crate::plugins::registry::PluginRegistry;

/// One scheduler tick.
pub const TICK: Duration = Duration::from_secs(1);

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(300);

/// Loop lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Resolving configuration, pre-loop.
    LoadingConfig,
    /// Ticking normally.
    Running,
    /// Re-reading a changed config mid-run.
    ReloadingConfig,
    /// Loop exited; pid record archived.
    Stopped,
}

/// The concrete polling loop tying config, plugins, pids, and the failure
/// monitor together for one context.
pub struct SchedulerLoop {
    config: Snapshot,
    registry: PluginRegistry,
    pids: PidRegistry,
    logger: Logger,
    mailer: Arc<dyn Mailer>,
    context: String,
    exit_path: PathBuf,
    heartbeat: Duration,
    quiet: Option<QuietWindow>,
    monitor: Option<FailureMonitor>,
    stop_flag: Arc<AtomicBool>,
    state: LoopState,
    keep_going: bool,
    last_heartbeat_at: Option<u64>,
}

impl SchedulerLoop {
    /// Build a loop for `context`. Requires `crawler.exitpath`; reads
    /// `crawler.heartbeat` and the optional `crawler.quiet-time` window.
    pub fn new(
        config: Snapshot,
        context: &str,
        pids: PidRegistry,
        logger: Logger,
        mailer: Arc<dyn Mailer>,
    ) -> Result<Self> {
        let exit_path = PathBuf::from(config.get("crawler", "exitpath")?);
        let heartbeat = config.get_time("crawler", "heartbeat", DEFAULT_HEARTBEAT)?;
        let quiet = config
            .get_opt("crawler", "quiet-time")
            .map(QuietWindow::parse)
            .transpose()?;
        let mut registry = PluginRegistry::new(logger.clone());
        let verbose = config.get_opt("crawler", "verbose").is_some_and(|raw| {
            matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "1" | "yes" | "true" | "on"
            )
        });
        registry.set_verbose(verbose);
        Ok(Self {
            config,
            registry,
            pids,
            logger,
            mailer,
            context: context.to_string(),
            exit_path,
            heartbeat,
            quiet,
            monitor: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            state: LoopState::LoadingConfig,
            keep_going: true,
            last_heartbeat_at: None,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// The registry, for embedders wiring extra factories before `run`.
    pub fn registry_mut(&mut self) -> &mut PluginRegistry {
        &mut self.registry
    }

    /// Resolve the plugin dir and load the configured plugin set now, so
    /// the caller can surface configuration errors while stderr is still
    /// the operator's terminal. `run` repeats the sync; a plugin loaded
    /// here keeps its state through that reload.
    pub fn preflight(&mut self) -> Result<()> {
        self.registry.sync(&self.config)
    }

    /// Run until stopped. Registers this instance's pid record on entry;
    /// the record is archived (renamed `.DEFUNCT`) on every exit path.
    pub fn run(&mut self) -> Result<()> {
        let guard = self.pids.register(&self.context, &self.exit_path)?;
        signals::register_termination(&self.stop_flag)?;
        // Startup sync: an unusable plugin-dir is fatal here; an individual
        // broken plugin is isolated inside sync.
        self.registry.sync(&self.config)?;

        self.state = LoopState::Running;
        self.logger.info(&format!(
            "crawler started: context={} pid={} exitpath={}",
            self.context,
            std::process::id(),
            self.exit_path.display()
        ));

        while self.keep_going {
            let tick_started = Instant::now();
            self.honor_stop_requests();
            if self.keep_going {
                self.maybe_reload();
                self.fire_due_plugins();
            }
            self.maybe_heartbeat(SystemTime::now());
            if self.keep_going {
                std::thread::sleep(TICK.saturating_sub(tick_started.elapsed()));
            }
        }

        self.state = LoopState::Stopped;
        self.logger
            .info(&format!("crawler stopped: context={}", self.context));
        drop(guard);
        Ok(())
    }

    /// Exit file and signal flag both clear the keep-going flag; the exit
    /// file is deleted as part of honoring it.
    fn honor_stop_requests(&mut self) {
        if self.exit_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.exit_path) {
                self.logger
                    .warn(&format!("could not remove exit file: {e}"));
            }
            self.logger.info("exit file honored; stopping");
            self.keep_going = false;
        }
        if self.stop_flag.swap(false, Ordering::SeqCst) {
            self.logger.info("termination signal honored; stopping");
            self.keep_going = false;
        }
    }

    /// Reload the config in place when its mtime has advanced, then
    /// converge the plugin set. A reload that fails to parse keeps the
    /// previous snapshot running.
    fn maybe_reload(&mut self) {
        if !self.config.changed() {
            return;
        }
        self.state = LoopState::ReloadingConfig;
        self.logger.info(&format!(
            "config {} changed; reloading",
            self.config.filename().display()
        ));
        if let Err(e) = self.config.reload() {
            self.logger
                .error(&format!("config reload failed, keeping previous: {e}"));
            self.state = LoopState::Running;
            return;
        }
        if let Err(e) = self.registry.sync(&self.config) {
            self.logger.error(&format!("plugin sync failed: {e}"));
        }
        self.state = LoopState::Running;
    }

    /// Walk the configured plugin list in config order and fire whatever is
    /// due. One failing plugin does not block the others in the same tick;
    /// its error feeds the failure monitor, which may clear keep-going so
    /// the loop exits at the next iteration rather than mid-tick.
    fn fire_due_plugins(&mut self) {
        if self.quiet_now() {
            return;
        }
        for name in self.config.get_list("crawler", "plugins") {
            if !self.registry.time_to_fire(&name) {
                continue;
            }
            if let Err(err) = self.registry.fire(&name, &self.config) {
                self.logger
                    .error(&format!("plugin {name} failed: {}", err.code()));
                if self.monitor.is_none() {
                    self.monitor = Some(self.build_monitor());
                }
                if let Some(monitor) = self.monitor.as_mut() {
                    if monitor.observe(&err) {
                        self.keep_going = false;
                    }
                }
            }
        }
    }

    /// The failure monitor is created lazily on the first exception so its
    /// thresholds reflect the config in force at that moment.
    fn build_monitor(&self) -> FailureMonitor {
        FailureMonitor::from_config(
            &self.config,
            self.logger.clone(),
            Arc::clone(&self.mailer),
            &self.context,
        )
        .unwrap_or_else(|e| {
            self.logger
                .warn(&format!("bad breaker limits, using defaults: {e}"));
            FailureMonitor::new(
                BreakerLimits::default(),
                self.logger.clone(),
                Arc::clone(&self.mailer),
                self.config.get_opt("crawler", "mailto").map(str::to_string),
                &self.context,
            )
        })
    }

    /// Emit a heartbeat once per interval, phase-aligned to wall-clock time
    /// (epoch modulo, not launch time), and also during quiet time.
    fn maybe_heartbeat(&mut self, now: SystemTime) {
        let interval = self.heartbeat.as_secs().max(1);
        let Ok(epoch) = now.duration_since(SystemTime::UNIX_EPOCH) else {
            return;
        };
        let slot = epoch.as_secs() / interval;
        if self.last_heartbeat_at == Some(slot) {
            return;
        }
        self.last_heartbeat_at = Some(slot);
        self.logger.info(&format!(
            "heartbeat: context={} plugins={} errors={}",
            self.context,
            self.registry.loaded_names().len(),
            self.monitor.as_ref().map_or(0, FailureMonitor::total_errors)
        ));
    }

    fn quiet_now(&self) -> bool {
        self.quiet
            .as_ref()
            .is_some_and(|w| w.contains(chrono::Local::now().time()))
    }
}

/// A daily wall-clock window during which scheduled firing is suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QuietWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl QuietWindow {
    /// Parse `"HH:MM-HH:MM"`. The window may wrap midnight.
    fn parse(spec: &str) -> Result<Self> {
        let bad = || CrawlerError::InvalidConfig {
            details: format!("quiet-time must be HH:MM-HH:MM, got {spec:?}"),
        };
        let (start, end) = spec.trim().split_once('-').ok_or_else(bad)?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| bad())?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| bad())?;
        Ok(Self { start, end })
    }

    fn contains(&self, now: NaiveTime) -> bool {
        // Truncate to whole minutes so "22:00" matches from 22:00:00.
        let now = now.with_second(0).unwrap_or(now).with_nanosecond(0).unwrap_or(now);
        if self.start <= self.end {
            self.start <= now && now < self.end
        } else {
            // Wraps midnight.
            now >= self.start || now < self.end
        }
    }
}
