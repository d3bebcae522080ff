//! Error types for the connd core
//!
//! This module defines all error types used throughout the crate.
//!
//! Variants fall into four groups:
//! - validation errors (rejected before any state is touched)
//! - resource errors (spawn failure, loss of the route feed)
//! - asynchronous runtime errors (IPC handler failures)
//! - programming errors (duplicate registration, mutating a running task)

use thiserror::Error;

/// Result type alias for connd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for connd
#[derive(Error, Debug)]
pub enum Error {
    /// An address string could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A netmask was malformed or non-contiguous
    #[error("Invalid netmask: {0}")]
    InvalidNetmask(String),

    /// An IPv6 prefix length outside 0..=128
    #[error("Invalid prefix length: {0}")]
    InvalidPrefixLength(u8),

    /// Address family does not match the configured or active family
    #[error("Address family mismatch: expected {expected}, got {actual}")]
    FamilyMismatch {
        /// Family the operation required
        expected: String,
        /// Family that was supplied
        actual: String,
    },

    /// Operation needs an active address family
    #[error("No address family set")]
    NoAddressFamily,

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A name was registered twice
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    /// Task operation not permitted in its current state
    #[error("Task {path}: cannot {operation} while {state}")]
    TaskState {
        /// Object path of the task
        path: String,
        /// Current state name
        state: String,
        /// Rejected operation
        operation: String,
    },

    /// Helper program could not be started
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program path
        program: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// The kernel route feed is gone and no further events will arrive
    #[error("Route feed lost: {0}")]
    FeedLost(String),

    /// An IPC handler rejected a request
    #[error("IPC error ({path} {member}): {message}")]
    Ipc {
        /// Object path of the task
        path: String,
        /// Member name the request was addressed to
        member: String,
        /// Handler message
        message: String,
    },

    /// Lookup failure
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an invalid address error
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create an invalid netmask error
    pub fn invalid_netmask(msg: impl Into<String>) -> Self {
        Self::InvalidNetmask(msg.into())
    }

    /// Create a family mismatch error
    pub fn family_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::FamilyMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a duplicate registration error
    pub fn already_registered(name: impl Into<String>) -> Self {
        Self::AlreadyRegistered(name.into())
    }

    /// Create a task state error
    pub fn task_state(
        path: impl Into<String>,
        state: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self::TaskState {
            path: path.into(),
            state: state.into(),
            operation: operation.into(),
        }
    }

    /// Create a feed loss error
    pub fn feed_lost(msg: impl Into<String>) -> Self {
        Self::FeedLost(msg.into())
    }

    /// Create an IPC error
    pub fn ipc(
        path: impl Into<String>,
        member: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Ipc {
            path: path.into(),
            member: member.into(),
            message: message.into(),
        }
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// True if the route feed can no longer deliver events
    pub fn is_feed_lost(&self) -> bool {
        matches!(self, Self::FeedLost(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
