//! A small service manager / init core for Unix systems.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Condition store.
pub mod cond;

/// Service line loader.
pub mod conf;

/// Constants.
pub mod constants;

/// Init context and timers.
pub mod ctx;

/// Errors.
pub mod error;

/// Event loop and control handling.
pub mod event;

/// Control protocol.
pub mod ipc;

/// Child stdio routing.
pub mod logs;

/// Netlink ingestor.
pub mod netlink;

/// Privilege dropping.
pub mod privilege;

/// Runtime paths and modes.
pub mod runtime;

/// Service supervision.
pub mod service;

/// Global state machine.
pub mod sm;

/// Service model and table.
pub mod svc;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
