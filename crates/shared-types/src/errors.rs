//! # Error Types
//!
//! Validation errors for the shared data model.

use thiserror::Error;

/// Errors raised while constructing subjects, patterns or stream definitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    /// Subject string is empty, has empty tokens, or contains wildcards.
    #[error("Invalid subject '{subject}': {reason}")]
    InvalidSubject { subject: String, reason: String },

    /// Subject pattern is malformed (e.g. `>` not in last position).
    #[error("Invalid subject pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Stream definition violates a structural rule.
    #[error("Invalid stream definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },
}
