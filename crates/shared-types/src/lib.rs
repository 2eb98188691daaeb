//! # Shared Types Crate
//!
//! The data model every other crate in the workspace speaks:
//!
//! - [`DomainEvent`] and its typed [`EventPayload`] variants
//! - [`Subject`] and [`SubjectPattern`] with wildcard matching and specificity
//! - [`StreamDefinition`] describing a durable stream's subjects and limits
//!
//! ## Design Principles
//!
//! - **Validated at the edge**: subjects, patterns and definitions cannot be
//!   constructed in an invalid state.
//! - **Subject decides kind**: the subject alone determines which payload
//!   variant an event carries.

pub mod envelope;
pub mod errors;
pub mod events;
pub mod stream;
pub mod subject;

pub use envelope::DomainEvent;
pub use errors::TypeError;
pub use events::{
    EventKind, EventPayload, ExplanationRequest, ExplanationResult, FieldViolation, MarketTick,
    ModelMetric, ModelType, PredictionEvent, RoutingDecision,
};
pub use stream::{
    Compression, RetentionPolicy, StorageClass, StreamDefinition, StreamDefinitionBuilder,
};
pub use subject::{Specificity, Subject, SubjectPattern};
