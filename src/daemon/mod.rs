//! Daemon subsystem: process detachment, pid registry, scheduler loop,
//! failure circuit breaker, signal handling.

pub mod breaker;
pub mod detach;
pub mod loop_main;
pub mod pids;
pub mod signals;
