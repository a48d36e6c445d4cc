//! Error types for chat-harvest
//!
//! This module provides error handling for the library, including:
//! - The crate-level [`Error`] with a [`Result`] alias
//! - [`SourceError`], the taxonomy of remote-source failures (rate limits,
//!   authentication, group resolution, transport)
//! - [`TrackerError`] for deduplication-tracker storage failures

use std::time::Duration;
use thiserror::Error;

/// Result type alias for chat-harvest operations
///
/// The error parameter defaults to the crate [`Error`]; trait seams that
/// speak [`SourceError`] or [`TrackerError`] name it explicitly.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for chat-harvest
///
/// This is the primary error type used throughout the library. Each variant
/// includes contextual information to help diagnose issues. Rate-limit
/// signals never reach callers through this type: they are absorbed by the
/// connection manager and the triggering operation is retried.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "connection.pool_size")
        key: Option<String>,
    },

    /// Remote message source error (resolution, transport, authentication)
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Deduplication tracker error
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// SQLx database error from a persistent tracker backend
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connection manager has been closed - no further sessions can be acquired
    #[error("closed: connection manager is shut down")]
    Closed,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Remote message source errors
///
/// Implementations of [`crate::source::MessageSource`] and
/// [`crate::source::SessionConnector`] surface their failures through this
/// type so the engine can classify them: rate limits are waited out,
/// authentication and resolution failures are fatal to the calling
/// operation, connection errors are retried on the connect path.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Server-imposed rate limit: pause for `retry_after` before retrying
    #[error("rate limited: retry after {}s", retry_after.as_secs())]
    RateLimited {
        /// How long the server instructed the caller to wait
        retry_after: Duration,
    },

    /// Authentication or session establishment failed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Group identifier could not be resolved to a concrete group
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// Transient transport failure (reset, timeout, dropped link)
    #[error("connection error: {0}")]
    Connection(String),

    /// The source does not provide this capability (e.g., live events)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Other source-side error
    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// The wait duration carried by a rate-limit signal, if this is one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Deduplication tracker and checkpoint storage errors
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Backend storage operation failed
    #[error("storage error: {0}")]
    Storage(String),

    /// A checkpoint save would move `last_message_id` backwards
    #[error(
        "checkpoint regression for operation {operation_id}: stored id {stored} > attempted id {attempted}"
    )]
    CheckpointRegression {
        /// The operation whose checkpoint was being saved
        operation_id: String,
        /// The `last_message_id` currently stored
        stored: i64,
        /// The smaller `last_message_id` the save attempted to write
        attempted: i64,
    },

    /// The backend does not implement this optional capability
    #[error("not supported: {0}")]
    NotSupported(String),
}
