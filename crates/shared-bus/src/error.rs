//! # Bus Errors
//!
//! Failures surfaced by a [`StreamBus`](crate::StreamBus) implementation.

use std::time::Duration;

use thiserror::Error;

/// Errors from bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The bus cannot be reached (connection refused, dropped, offline).
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// The bus did not answer within the allotted time.
    #[error("Bus operation timed out after {0:?}")]
    Timeout(Duration),

    /// No stream with this name exists.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// No declared stream captures the subject or filter.
    #[error("No stream captures subject '{0}'")]
    NoStreamForSubject(String),

    /// A stream with this name exists with a different configuration.
    #[error("Stream '{name}' already exists with a different configuration: {reason}")]
    StreamConflict { name: String, reason: String },

    /// The stream's subjects collide with another stream's subjects.
    #[error("Subjects of stream '{name}' overlap stream '{other}'")]
    SubjectOverlap { name: String, other: String },

    /// Payload exceeds the stream's per-message limit.
    #[error("Message of {size} bytes exceeds stream '{stream}' limit of {max} bytes")]
    MessageTooLarge { stream: String, size: usize, max: usize },

    /// Ack/nack for a message the bus does not know about.
    #[error("Unknown message {stream}#{sequence}")]
    UnknownMessage { stream: String, sequence: u64 },

    /// The bus refused the request for another reason.
    #[error("Bus rejected request: {0}")]
    Rejected(String),
}

impl BusError {
    /// True for failures that may succeed if retried later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Unavailable(_) | BusError::Timeout(_))
    }
}
