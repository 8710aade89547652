//! Shipped checks.
//!
//! `disk_free` watches free space on a mount; `marker` appends a timestamp
//! to a file, which makes it a cheap liveness probe and the plugin the
//! end-to-end tests schedule.

use std::path::PathBuf;

use crate::core::config::Snapshot;
use crate::core::errors::{CrawlerError, Result};

use super::Check;

/// Factory for the `disk_free` check.
pub fn disk_free(section: &str) -> Box<dyn Check> {
    Box::new(DiskFree {
        section: section.to_string(),
    })
}

/// Factory for the `marker` check.
pub fn marker(section: &str) -> Box<dyn Check> {
    Box::new(Marker {
        section: section.to_string(),
    })
}

/// Fails when free space on the configured path drops below a percentage.
///
/// Options: `path` (default `/`), `min-free-pct` (default 10).
struct DiskFree {
    section: String,
}

impl Check for DiskFree {
    #[cfg(unix)]
    fn run(&mut self, config: &Snapshot) -> Result<()> {
        let path = config
            .get_opt(&self.section, "path")
            .unwrap_or("/")
            .to_string();
        let floor = config.get_usize(&self.section, "min-free-pct", 10)?;

        let stats = nix::sys::statvfs::statvfs(path.as_str()).map_err(|e| {
            CrawlerError::CheckFailed {
                plugin: self.section.clone(),
                details: format!("statvfs {path}: {e}"),
            }
        })?;
        let total = stats.blocks();
        if total == 0 {
            return Err(CrawlerError::CheckFailed {
                plugin: self.section.clone(),
                details: format!("{path}: filesystem reports zero blocks"),
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let free_pct = (u128::from(stats.blocks_available()) * 100 / u128::from(total)) as u64;
        if free_pct < floor as u64 {
            return Err(CrawlerError::CheckFailed {
                plugin: self.section.clone(),
                details: format!("{path}: {free_pct}% free, floor is {floor}%"),
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn run(&mut self, _config: &Snapshot) -> Result<()> {
        Err(CrawlerError::CheckFailed {
            plugin: self.section.clone(),
            details: "disk_free requires a unix target".to_string(),
        })
    }
}

/// Appends an RFC 3339 timestamp to the configured `path`.
struct Marker {
    section: String,
}

impl Check for Marker {
    fn run(&mut self, config: &Snapshot) -> Result<()> {
        let path = PathBuf::from(config.get(&self.section, "path")?);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CrawlerError::io(parent, e))?;
            }
        }
        let line = format!("{}\n", chrono::Utc::now().to_rfc3339());
        let mut contents = std::fs::read_to_string(&path).unwrap_or_default();
        contents.push_str(&line);
        std::fs::write(&path, contents).map_err(|e| CrawlerError::io(&path, e))
    }
}
