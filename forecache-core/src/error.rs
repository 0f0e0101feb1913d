//! Error types for forecache operations

use std::time::Duration;
use thiserror::Error;

/// Key derivation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Cache subject must not be empty")]
    EmptySubject,

    #[error("Invalid cache subject {subject:?}: {reason}")]
    InvalidSubject { subject: String, reason: String },

    #[error("Invalid cache namespace {namespace:?}: {reason}")]
    InvalidNamespace { namespace: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Remote store errors.
///
/// These are produced by remote store implementations and consumed by the
/// cache layer, which treats every one of them as a miss on the remote tier.
/// There is deliberately no conversion into [`CacheError`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote store connection failed: {reason}")]
    Connect { reason: String },

    #[error("Remote store {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Remote store {operation} failed: {reason}")]
    Operation {
        operation: &'static str,
        reason: String,
    },

    #[error("No remote store is configured")]
    Unavailable,
}

impl RemoteError {
    /// Wrap a failure of a single remote command.
    pub fn operation(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Operation {
            operation,
            reason: err.to_string(),
        }
    }

    /// Wrap a failure to establish a connection.
    pub fn connect(err: impl std::fmt::Display) -> Self {
        Self::Connect {
            reason: err.to_string(),
        }
    }
}

/// Master error type for caller-visible forecache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Artifact source failed: {reason}")]
    Source { reason: String },
}

impl CacheError {
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }

    pub fn source(err: impl std::fmt::Display) -> Self {
        Self::Source {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

/// Result type alias for forecache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Result type alias for remote store operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

// =============================================================================
// TESTS
// =============================================================================
