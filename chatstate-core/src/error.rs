use std::{fmt, time::Duration};

use thiserror::Error;

/// Failure surfaced by a checkpoint or profile store.
///
/// A missing thread, checkpoint or profile is never an error: lookups return
/// `Ok(None)` and deletes of absent records return `Ok(())`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("failed to decode stored {what}: {reason}")]
    Serialization { what: &'static str, reason: String },
    #[error("store backend unavailable: {0}")]
    Transient(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Serialization,
    Transient,
    Cancelled,
    Configuration,
}

impl StoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation(message.into())
    }

    pub fn serialization(what: &'static str, reason: impl fmt::Display) -> Self {
        StoreError::Serialization {
            what,
            reason: reason.to_string(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        StoreError::Transient(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::Serialization { .. } => ErrorKind::Serialization,
            StoreError::Transient(_) | StoreError::Timeout(_) => ErrorKind::Transient,
            StoreError::Cancelled => ErrorKind::Cancelled,
            StoreError::InvalidConfig(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the caller may retry the same operation with backoff.
    ///
    /// The stores never retry internally.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Cancelled)
    }
}
