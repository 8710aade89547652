//! Plugin registry: converges loaded units to the configured plugin set and
//! tracks per-plugin cadence.
//!
//! Reload is evict-then-reresolve-then-reinsert against the factory table;
//! cadence state (`last_fired_at`) survives a reload so a config touch does
//! not make every plugin instantly due again.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::core::config::Snapshot;
use crate::core::errors::{CrawlerError, Result};
use crate::logger::Logger;
use crate::plugins::{builtin_factories, Check, CheckFactory};

/// Default cadence when a plugin section carries no `frequency`.
pub const DEFAULT_FREQUENCY: Duration = Duration::from_secs(3600);

/// Boolean literals accepted (case-insensitively) as a true `fire` option.
const FIRABLE_TRUE: &[&str] = &["1", "yes", "true", "on"];

/// One loaded plugin and its scheduling state.
pub struct PluginDescriptor {
    name: String,
    check: Box<dyn Check>,
    frequency: Duration,
    firable: bool,
    last_fired_at: SystemTime,
    source_dir: PathBuf,
    loaded_at: SystemTime,
}

impl PluginDescriptor {
    /// Configured section name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cadence between fires.
    #[must_use]
    pub fn frequency(&self) -> Duration {
        self.frequency
    }

    /// Whether the `fire` option permits running.
    #[must_use]
    pub fn firable(&self) -> bool {
        self.firable
    }

    /// Last successful fire.
    #[must_use]
    pub fn last_fired_at(&self) -> SystemTime {
        self.last_fired_at
    }

    /// Plugin directory in force when loaded.
    #[must_use]
    pub fn source_dir(&self) -> &PathBuf {
        &self.source_dir
    }

    /// When this unit was (re)instantiated.
    #[must_use]
    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }
}

/// Maps configured plugin names to loaded units.
pub struct PluginRegistry {
    descriptors: BTreeMap<String, PluginDescriptor>,
    factories: HashMap<String, CheckFactory>,
    logger: Logger,
    verbose: bool,
}

impl PluginRegistry {
    /// Registry seeded with the compiled-in factory table.
    #[must_use]
    pub fn new(logger: Logger) -> Self {
        Self {
            descriptors: BTreeMap::new(),
            factories: builtin_factories(),
            logger,
            verbose: false,
        }
    }

    /// Add (or replace) a factory. This is the extension point for
    /// embedders shipping their own checks.
    pub fn register_factory(&mut self, name: &str, factory: CheckFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// When set, a non-firable plugin still has its cadence stamped on a
    /// declined fire, avoiding per-tick re-evaluation noise. Wired to the
    /// `crawler.verbose` config option by the scheduler loop.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Current verbose setting.
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Names currently loaded, sorted.
    #[must_use]
    pub fn loaded_names(&self) -> Vec<&str> {
        self.descriptors.keys().map(String::as_str).collect()
    }

    /// Loaded descriptor, if any.
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<&PluginDescriptor> {
        self.descriptors.get(name)
    }

    /// Load `name` from the factory table, or reload it in place.
    ///
    /// Re-reads `fire` and `frequency` from the plugin's section. A reload
    /// discards the old unit and re-instantiates, keeping `last_fired_at`.
    /// The unusable-plugin-dir case is the only configuration error raised
    /// directly; an unknown name is the import-error analog.
    pub fn load_or_reload(&mut self, name: &str, config: &Snapshot) -> Result<()> {
        let source_dir = resolve_plugin_dir(config)?;
        let firable = parse_firable(config.get_opt(name, "fire"));
        let frequency = config.get_time(name, "frequency", DEFAULT_FREQUENCY)?;

        let factory = self.factories.get(name).copied().ok_or_else(|| {
            CrawlerError::PluginLoad {
                name: name.to_string(),
                details: "no such plugin in the factory table".to_string(),
            }
        })?;

        let now = SystemTime::now();
        if let Some(descriptor) = self.descriptors.get_mut(name) {
            descriptor.check = factory(name);
            descriptor.frequency = frequency;
            descriptor.firable = firable;
            descriptor.source_dir = source_dir;
            descriptor.loaded_at = now;
            self.logger.info(&format!("reloaded plugin {name}"));
        } else {
            // A fresh plugin is immediately eligible: pretend it last fired
            // just over one full period ago.
            let last_fired_at = now
                .checked_sub(frequency + Duration::from_secs(1))
                .unwrap_or(SystemTime::UNIX_EPOCH);
            self.descriptors.insert(
                name.to_string(),
                PluginDescriptor {
                    name: name.to_string(),
                    check: factory(name),
                    frequency,
                    firable,
                    last_fired_at,
                    source_dir,
                    loaded_at: now,
                },
            );
            self.logger.info(&format!("loaded plugin {name}"));
        }
        Ok(())
    }

    /// Whether `name` is due: strictly more than one full period since the
    /// last fire. Unknown names are never due.
    #[must_use]
    pub fn time_to_fire(&self, name: &str) -> bool {
        self.time_to_fire_at(name, SystemTime::now())
    }

    /// [`Self::time_to_fire`] against an explicit clock, for tests.
    #[must_use]
    pub fn time_to_fire_at(&self, name: &str, now: SystemTime) -> bool {
        self.descriptors.get(name).is_some_and(|d| {
            now.duration_since(d.last_fired_at)
                .is_ok_and(|elapsed| elapsed > d.frequency)
        })
    }

    /// Run `name` if it is firable, stamping its cadence on success.
    /// A declined fire is logged; with the verbose flag set the cadence is
    /// stamped anyway so the decline is not re-evaluated every tick.
    pub fn fire(&mut self, name: &str, config: &Snapshot) -> Result<()> {
        self.fire_at(name, config, SystemTime::now())
    }

    /// [`Self::fire`] against an explicit clock, for tests.
    pub fn fire_at(&mut self, name: &str, config: &Snapshot, now: SystemTime) -> Result<()> {
        let verbose = self.verbose;
        let descriptor = self
            .descriptors
            .get_mut(name)
            .ok_or_else(|| CrawlerError::PluginLoad {
                name: name.to_string(),
                details: "not loaded".to_string(),
            })?;
        if descriptor.firable {
            descriptor.check.run(config)?;
            descriptor.last_fired_at = now;
        } else {
            self.logger
                .info(&format!("declining to fire {name}: fire option is off"));
            if verbose {
                descriptor.last_fired_at = now;
            }
        }
        Ok(())
    }

    /// Run `name` right now, ignoring `fire` and leaving cadence untouched.
    /// Debugging path behind the `fire` subcommand.
    pub fn force_fire(&mut self, name: &str, config: &Snapshot) -> Result<()> {
        let descriptor = self
            .descriptors
            .get_mut(name)
            .ok_or_else(|| CrawlerError::PluginLoad {
                name: name.to_string(),
                details: "not loaded".to_string(),
            })?;
        descriptor.check.run(config)
    }

    /// Drop `name`. Returns whether it was loaded.
    pub fn unload(&mut self, name: &str) -> bool {
        let removed = self.descriptors.remove(name).is_some();
        if removed {
            self.logger.info(&format!("unloaded plugin {name}"));
        }
        removed
    }

    /// Converge the loaded set to `crawler.plugins`.
    ///
    /// Every configured name is (re)loaded, every other name unloaded. A
    /// single plugin failing to load is logged and skipped so one broken
    /// plugin does not keep the rest from scheduling; an unusable
    /// plugin-dir fails the whole sync since nothing could load anyway.
    pub fn sync(&mut self, config: &Snapshot) -> Result<()> {
        resolve_plugin_dir(config)?;
        let configured = config.get_list("crawler", "plugins");
        for name in &configured {
            if let Err(err) = self.load_or_reload(name, config) {
                self.logger
                    .error(&format!("skipping plugin {name}: {err}"));
            }
        }
        let stale: Vec<String> = self
            .descriptors
            .keys()
            .filter(|n| !configured.iter().any(|c| c == *n))
            .cloned()
            .collect();
        for name in stale {
            self.unload(&name);
        }
        Ok(())
    }
}

/// `crawler.plugin-dir` must name a searchable directory.
fn resolve_plugin_dir(config: &Snapshot) -> Result<PathBuf> {
    let dir = PathBuf::from(config.get("crawler", "plugin-dir")?);
    let meta = std::fs::metadata(&dir).map_err(|e| CrawlerError::PluginDir {
        path: dir.clone(),
        details: e.to_string(),
    })?;
    if !meta.is_dir() {
        return Err(CrawlerError::PluginDir {
            path: dir,
            details: "not a directory".to_string(),
        });
    }
    Ok(dir)
}

/// `fire` option semantics: absent is firable, a recognized false literal
/// is not, and an unrecognized literal is treated as not firable.
fn parse_firable(option: Option<&str>) -> bool {
    // False literals (no/false/off/0) and garbage both read as not
    // firable: an unrecognized value must never enable firing.
    option.map_or(true, |raw| {
        FIRABLE_TRUE.contains(&raw.trim().to_ascii_lowercase().as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firable_literals() {
        assert!(parse_firable(None));
        for yes in ["yes", "YES", "true", "On", "1"] {
            assert!(parse_firable(Some(yes)), "rejected {yes:?}");
        }
        for no in ["no", "False", "off", "0", "maybe", "42"] {
            assert!(!parse_firable(Some(no)), "accepted {no:?}");
        }
    }
}
