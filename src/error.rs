//! Typed errors for session tracking and storage.
//!
//! The binary works with `anyhow::Result`; everything below the CLI returns
//! one of these so callers can tell a malformed request apart from an
//! expired session or a store that is down.

use std::time::Duration;
use thiserror::Error;

/// Failures raised by a [`SessionStore`](crate::store::SessionStore) adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend did not answer within the configured bound.
    #[error("store did not respond within {0:?}")]
    Timeout(Duration),

    /// Connection, I/O or SQL failure inside the backend.
    #[error("store backend error: {0}")]
    Backend(String),

    /// Stored bytes could not be encoded or decoded.
    #[error("store codec error: {0}")]
    Codec(String),

    /// A key holds a value of another shape (plain value vs. list).
    #[error("wrong value type stored under '{0}'")]
    WrongType(String),

    #[error("store lock poisoned")]
    Poisoned,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// Errors surfaced by the session tracker and the inbound API.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed event input. Nothing was written.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The session id is unknown or its TTL elapsed. Callers start a new
    /// session or fall back to an anonymous context.
    #[error("session '{0}' not found or expired")]
    SessionNotFound(String),

    /// The backing store timed out or failed.
    #[error("session store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Rejected configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
