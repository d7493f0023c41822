// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the stream replicator.
//!
//! Errors are categorized by where they occur (configuration, broker
//! connections, broker operations, snapshot files) and carry enough context
//! to tell which link or connection produced them.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Broker` | Yes | Publish/subscribe/ack failed on a live connection |
//! | `Connection` | Yes | Connect sequence gave up (cancelled) or connection missing |
//! | `Snapshot` | No | Dedup cache file could not be read or written |
//! | `Serialization` | No | JSON encode/decode failure |
//! | `Config` | No | Link configuration invalid |
//! | `InvalidState` | No | Replicator state machine violation |
//! | `Shutdown` | No | Cancellation was requested |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Nothing inside the crate retries on [`ReplicationError::is_retryable()`]
//! directly; connect loops retry every failure until cancelled. The flag is
//! for callers deciding whether a failed worker is worth restarting.

use crate::broker::BrokerError;
use thiserror::Error;

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while replicating a link.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Invalid or missing link configuration.
    ///
    /// Raised by [`crate::config::LinkConfig::setup`] before any task starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A connection could not be established or is not available.
    ///
    /// Returned when the connect sequence is cancelled before a session
    /// exists, or when an operation needs a session that is not there.
    #[error("Connection error ({name}): {message}")]
    Connection { name: String, message: String },

    /// A broker operation failed on an established connection.
    #[error("Broker error ({operation}): {source}")]
    Broker {
        operation: String,
        #[source]
        source: BrokerError,
    },

    /// Dedup cache snapshot could not be read or written.
    #[error("Snapshot error ({path}): {message}")]
    Snapshot { path: String, message: String },

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Replicator state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` twice).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Cancellation was requested while waiting.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Wrap a broker failure with the operation that produced it.
    pub fn broker(operation: impl Into<String>, source: BrokerError) -> Self {
        Self::Broker {
            operation: operation.into(),
            source,
        }
    }

    /// Create a connection error for the named connection.
    pub fn connection(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a snapshot error for a file path.
    pub fn snapshot(path: impl AsRef<std::path::Path>, message: impl std::fmt::Display) -> Self {
        Self::Snapshot {
            path: path.as_ref().display().to_string(),
            message: message.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker { .. } => true,
            Self::Connection { .. } => true,
            Self::Snapshot { .. } => false,
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
