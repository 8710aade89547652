//! check-crawler: a long-running host daemon that fires storage check
//! plugins on per-plugin schedules, one instance per context, with a
//! failure circuit breaker deciding when accumulated plugin errors must
//! shut an instance down.
//!
//! The library layers bottom-up: [`core`] (errors, config snapshot),
//! [`logger`] and [`mail`] (ambient sinks), [`plugins`] (the runnable-unit
//! contract and registry), and [`daemon`] (detachment, pid registry,
//! breaker, scheduler loop). The `crawlerd` binary is a thin clap dispatch
//! over [`cli_app`].

#[cfg(feature = "cli")]
pub mod cli_app;
pub mod core;
pub mod daemon;
pub mod logger;
pub mod mail;
pub mod plugins;

pub use crate::core::errors::{CrawlerError, Result};
