// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the fan-out pipeline.
//!
//! Every failure is mapped onto one of four delivery categories
//! ([`ErrorKind`]). The category decides what happens to the change event
//! that triggered it: redelivered in a later batch, or counted towards the
//! dead-letter threshold.
//!
//! # Error Categories
//!
//! | Error Type | Kind | Redelivered | Description |
//! |------------|------|-------------|-------------|
//! | `TransientDependency` | TRANSIENT_DEPENDENCY_ERROR | Yes | Speech engine, artifact store or bus hiccup |
//! | `Timeout` | TRANSIENT_DEPENDENCY_ERROR | Yes | External call exceeded its deadline |
//! | `Throttled` | TRANSIENT_DEPENDENCY_ERROR | Yes | Dependency asked us to slow down |
//! | `CircuitOpen` | TRANSIENT_DEPENDENCY_ERROR | Yes | Target circuit is open, call not attempted |
//! | `Redis` | TRANSIENT_DEPENDENCY_ERROR | Yes | Network errors talking to Redis |
//! | `CursorStore` | TRANSIENT_DEPENDENCY_ERROR | Yes | Local SQLite errors |
//! | `Shutdown` | TRANSIENT_DEPENDENCY_ERROR | Yes | Pipeline is stopping, next activation redelivers |
//! | `Internal` | TRANSIENT_DEPENDENCY_ERROR | Yes | Unexpected failure, redelivered rather than lost |
//! | `Conflict` | CONFLICT | Yes | Record deleted or changed underneath a conditional write |
//! | `Validation` | VALIDATION_ERROR | No | Malformed record, missing required field |
//! | `StreamParse` | VALIDATION_ERROR | No | Malformed change entry at the source |
//! | `Decompression` | VALIDATION_ERROR | No | Corrupt image payload |
//! | `Config` | VALIDATION_ERROR | No | Configuration invalid |
//! | `InvalidState` | VALIDATION_ERROR | No | Reader or engine state machine violation |
//! | `ExhaustedRetry` | EXHAUSTED_RETRY | No | Attempt ceiling reached, record dead-lettered |
//!
//! # Retry Behavior
//!
//! [`FanoutError::is_retryable()`] answers "should the upstream redeliver
//! this record?". Non-retryable failures are still reported as batch-item
//! failures until the dead-letter threshold is reached, so nothing is lost
//! silently.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for fan-out operations.
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Delivery failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientDependency,
    Validation,
    Conflict,
    ExhaustedRetry,
}

impl ErrorKind {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientDependency => "TRANSIENT_DEPENDENCY_ERROR",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::ExhaustedRetry => "EXHAUSTED_RETRY",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for ErrorKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Errors that can occur while reading, routing or delivering changes.
#[derive(Error, Debug)]
pub enum FanoutError {
    /// A downstream dependency failed in a way that may succeed later.
    #[error("Transient dependency error ({dependency}): {message}")]
    TransientDependency { dependency: String, message: String },

    /// An external call exceeded its deadline.
    #[error("Timeout after {timeout:?} during {operation}")]
    Timeout { operation: String, timeout: Duration },

    /// A dependency rejected the call because of rate limits.
    #[error("Throttled by {dependency}")]
    Throttled { dependency: String },

    /// The target's circuit breaker is open; the call was not attempted.
    #[error("Circuit open for target {target}")]
    CircuitOpen { target: String },

    /// Record is malformed or a required field is missing.
    #[error("Validation error ({field}): {message}")]
    Validation { field: String, message: String },

    /// Record was deleted or changed underneath a conditional write.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Attempt ceiling reached for a record.
    #[error("Exhausted retries after {attempts} attempts: {last_error}")]
    ExhaustedRetry { attempts: u32, last_error: String },

    /// Redis connection or command error.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error during checkpoint persistence.
    #[error("Cursor store error: {0}")]
    CursorStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Zstd decompression failure on an image payload.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Change entry has an unexpected format.
    #[error("Stream parse error: {0}")]
    StreamParse(String),

    /// Operation attempted in the wrong state.
    ///
    /// E.g. asking for a new batch while the previous one on the same
    /// shard is still unacknowledged.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FanoutError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn transient(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientDependency {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Map this error onto the delivery taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientDependency { .. }
            | Self::Timeout { .. }
            | Self::Throttled { .. }
            | Self::CircuitOpen { .. }
            | Self::Redis { .. }
            | Self::CursorStore(_)
            | Self::Shutdown
            | Self::Internal(_) => ErrorKind::TransientDependency,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::ExhaustedRetry { .. } => ErrorKind::ExhaustedRetry,
            Self::Validation { .. }
            | Self::StreamParse(_)
            | Self::Decompression(_)
            | Self::Config(_)
            | Self::InvalidState { .. } => ErrorKind::Validation,
        }
    }

    /// Check if the record that caused this error should be redelivered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientDependency | ErrorKind::Conflict
        )
    }
}

impl From<redis::RedisError> for FanoutError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<serde_json::Error> for FanoutError {
    fn from(e: serde_json::Error) -> Self {
        Self::validation("json", e.to_string())
    }
}
