//! Error types for the stream gateway

use std::fmt;
use std::time::Duration;

use shared_bus::BusError;
use shared_types::TypeError;
use thiserror::Error;

use crate::config::ConfigError;

/// How a failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Fatal at startup; the process should not continue.
    Configuration,
    /// Fatal for this one event; retrying cannot help.
    Validation,
    /// Retryable; the bus may recover.
    Transient,
    /// A handler failed; isolated to the message, redelivered up to the limit.
    Handler,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorClass::Configuration => "configuration",
            ErrorClass::Validation => "validation",
            ErrorClass::Transient => "transient",
            ErrorClass::Handler => "handler",
        })
    }
}

/// Errors that can occur in the stream gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid stream definition: {0}")]
    InvalidDefinition(#[from] TypeError),

    #[error("Stream '{name}' conflicts with the existing declaration: {reason}")]
    StreamConflict { name: String, reason: String },

    #[error("Subject '{subject}' is claimed with equal specificity by streams {streams:?}")]
    AmbiguousSubject { subject: String, streams: Vec<String> },

    #[error("A handler is already registered for '{0}'")]
    DuplicateRoute(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unknown event type for subject '{0}'")]
    UnknownEventType(String),

    #[error("No stream captures subject '{0}'")]
    NoMatchingStream(String),

    #[error("Payload of {size} bytes exceeds stream '{stream}' limit of {max} bytes")]
    PayloadTooLarge { stream: String, size: usize, max: usize },

    #[error("Bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("Publish not acknowledged within {0:?}")]
    PublishTimeout(Duration),

    #[error("No handler registered for subject '{0}'")]
    NoHandlerRegistered(String),

    #[error("Handler '{handler}' failed: {reason}")]
    HandlerFailed { handler: String, reason: String },

    #[error("Bus error: {0}")]
    Bus(BusError),
}

impl GatewayError {
    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::InvalidDefinition(_)
            | GatewayError::StreamConflict { .. }
            | GatewayError::AmbiguousSubject { .. }
            | GatewayError::DuplicateRoute(_)
            | GatewayError::Config(_) => ErrorClass::Configuration,

            GatewayError::SchemaViolation(_)
            | GatewayError::MalformedPayload(_)
            | GatewayError::UnknownEventType(_)
            | GatewayError::NoMatchingStream(_)
            | GatewayError::PayloadTooLarge { .. } => ErrorClass::Validation,

            GatewayError::BusUnavailable(_) | GatewayError::PublishTimeout(_) => {
                ErrorClass::Transient
            }

            GatewayError::NoHandlerRegistered(_) | GatewayError::HandlerFailed { .. } => {
                ErrorClass::Handler
            }

            GatewayError::Bus(e) if e.is_transient() => ErrorClass::Transient,
            GatewayError::Bus(_) => ErrorClass::Configuration,
        }
    }

    /// Only transient failures are worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<BusError> for GatewayError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Unavailable(reason) => GatewayError::BusUnavailable(reason),
            BusError::Timeout(after) => {
                GatewayError::BusUnavailable(format!("bus did not answer within {after:?}"))
            }
            BusError::NoStreamForSubject(subject) => GatewayError::NoMatchingStream(subject),
            BusError::MessageTooLarge { stream, size, max } => {
                GatewayError::PayloadTooLarge { stream, size, max }
            }
            BusError::StreamConflict { name, reason } => {
                GatewayError::StreamConflict { name, reason }
            }
            other => GatewayError::Bus(other),
        }
    }
}
