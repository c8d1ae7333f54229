//! Durable, retry-driven notification delivery daemon.
//!
//! Notifications are committed as rename-atomic files in a spool
//! directory whose filenames encode the scheduling state, a single
//! delivery loop escalates each entry across pluggable transports
//! according to a retry script, and a persistent XMPP session delivers
//! to presence-aware recipients.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
// OpenSSL is only needed for static linking on musl
#[cfg(all(target_os = "linux", target_env = "musl"))]
use openssl_sys as _;
#[cfg(test)]
use predicates as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Config loading.
pub mod config;

/// Constants.
pub mod constants;

/// Delivery loop.
pub mod delivery;

/// Errors.
pub mod error;

/// Queue directory lock.
pub mod lock;

/// Transport drivers.
pub mod providers;

/// Persistent queue.
pub mod queue;

/// Retry policy.
pub mod retry;

/// Directory watcher.
pub mod watcher;
