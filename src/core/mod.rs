//! Core primitives: error taxonomy and the configuration snapshot.

pub mod config;
pub mod errors;
