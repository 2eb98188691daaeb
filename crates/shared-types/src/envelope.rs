//! # Domain Event Envelope
//!
//! The immutable unit handed to the publisher and delivered to handlers.
//!
//! - `event_id` identifies the event across redeliveries and is the default
//!   dedup key.
//! - `subject` is the routing key; it must map to the payload's kind.
//! - `producer_id` names the upstream component that created the event.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::events::{EventKind, EventPayload};
use crate::subject::Subject;

/// A typed, immutable domain event.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    /// Unique event identity.
    pub event_id: Uuid,
    /// Hierarchical routing key.
    pub subject: Subject,
    /// When the event happened at the producer (UTC).
    pub occurred_at: DateTime<Utc>,
    /// Upstream producer that created the event.
    pub producer_id: String,
    /// Schema-validated body.
    pub payload: EventPayload,
}

impl DomainEvent {
    /// Create a new event stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(subject: Subject, producer_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            subject,
            occurred_at: Utc::now(),
            producer_id: producer_id.into(),
            payload,
        }
    }

    /// Replace the occurrence time (builder style).
    #[must_use]
    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }

    /// Replace the event id (builder style).
    #[must_use]
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Kind of the payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
