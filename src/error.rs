//! Error handling for notifyg.
use std::path::PathBuf;

use thiserror::Error;

/// Defines all possible fatal errors of the notification daemon.
///
/// Everything in here either aborts startup or terminates the delivery
/// loop; per-message delivery failures are [`SendError`] instead.
#[derive(Debug, Error)]
pub enum NotifygError {
    /// Error reading or accessing the configuration file.
    #[error("Failed to read config file {path:?}: {source}")]
    ConfigRead {
        /// The configuration file that could not be read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Invalid configuration contents.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A retry token references a provider that is unknown or was skipped
    /// during registry construction.
    #[error("Retry policy references unusable provider '{provider}': {reason}")]
    RetryProvider {
        /// The provider name used in the retry policy.
        provider: String,
        /// Why the provider is not usable.
        reason: String,
    },

    /// I/O failure on the queue directory or one of its entries.
    #[error("Queue error on {path:?}: {source}")]
    QueueIo {
        /// The file or directory the operation failed on.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The queue directory is unusable (missing, not a directory, bad
    /// permissions).
    #[error("Queue directory unusable: {0}")]
    QueueDir(String),

    /// Another daemon already holds the queue lock.
    #[error("Queue directory is locked by pid {owner:?}")]
    QueueLocked {
        /// The pid recorded in the lock symlink, if it could be read.
        owner: Option<i32>,
    },

    /// A lock instance was asked to acquire a lock it already holds.
    #[error("Lock already held by this instance")]
    AlreadyLocked,

    /// Low-level system call failure (signals, pipes, inotify, poll).
    #[error("System error: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// A provider reported a fatal condition that must take the daemon down.
    #[error("Provider '{provider}' failed fatally: {reason}")]
    ProviderFatal {
        /// The provider that reported the condition.
        provider: String,
        /// The fatal condition.
        reason: String,
    },
}

impl NotifygError {
    /// Process exit code for this error, following the daemon contract:
    /// configuration problems exit 2, a held queue lock exits 3, anything
    /// else exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigRead { .. }
            | Self::ConfigParse(_)
            | Self::Config(_)
            | Self::RetryProvider { .. } => 2,
            Self::QueueLocked { .. } => 3,
            _ => 1,
        }
    }
}

/// Delivery failure taxonomy shared by every transport.
///
/// The variant decides what the queue does next: permanent and
/// configuration failures skip the pending wait and move straight to the
/// next provider, temporary failures honor it, and fatal failures
/// propagate out of the delivery loop.
#[derive(Debug, Error)]
pub enum SendError {
    /// Retrying later cannot help (malformed recipient data, rejected
    /// authentication, contact not on the roster).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    /// Retrying later may help (network failure, remote server error,
    /// contact offline).
    #[error("temporary delivery failure: {0}")]
    Temporary(String),

    /// The provider or contact is misconfigured; treated like a permanent
    /// failure by the queue.
    #[error("provider configuration error: {0}")]
    Config(String),

    /// The provider is irrecoverably broken and the daemon must stop.
    #[error("fatal provider failure: {0}")]
    Fatal(String),
}

impl SendError {
    /// Whether the queue should skip pending waits before the next
    /// provider. Waiting does not help when the failure is permanent.
    pub fn skips_wait(&self) -> bool {
        matches!(self, Self::Permanent(_) | Self::Config(_))
    }
}
