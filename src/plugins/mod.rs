//! Check plugins: the runnable-unit contract, the compiled-in factory table,
//! and the registry that schedules loaded units.
//!
//! A plugin is anything implementing [`Check`]; the loader resolves a
//! configured name to a unit through a factory table rather than a
//! language-level module cache, so "reload" is evict, re-instantiate,
//! reinsert. The shipped checks live in [`builtin`]; embedders extend the
//! table through [`registry::PluginRegistry::register_factory`].

pub mod builtin;
pub mod registry;

use std::collections::HashMap;

use crate::core::config::Snapshot;
use crate::core::errors::Result;

/// A runnable check unit. The return value of a run is ignored by
/// convention; domain failures surface as errors and flow to the
/// failure monitor.
pub trait Check: Send {
    /// Execute the check against the current config snapshot.
    fn run(&mut self, config: &Snapshot) -> Result<()>;
}

/// Constructs a check unit for the named config section.
pub type CheckFactory = fn(&str) -> Box<dyn Check>;

/// The compiled-in plugin table.
#[must_use]
pub fn builtin_factories() -> HashMap<String, CheckFactory> {
    let mut table: HashMap<String, CheckFactory> = HashMap::new();
    table.insert("disk_free".to_string(), builtin::disk_free);
    table.insert("marker".to_string(), builtin::marker);
    table
}
