//! # Codec
//!
//! Bytes ⇄ [`DomainEvent`]. The wire form is a JSON envelope:
//!
//! ```text
//! {"event_id":"…","subject":"predictions.normal.AAPL","occurred_at":"…",
//!  "producer_id":"normal-agent","type":"prediction","data":{…}}
//! ```
//!
//! Envelope fields are written in that fixed order and `data` keys are
//! sorted, so the same event always encodes to the same bytes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{DomainEvent, EventKind, EventPayload, Subject};
use uuid::Uuid;

use crate::error::GatewayError;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEnvelope {
    event_id: Uuid,
    subject: String,
    occurred_at: DateTime<Utc>,
    producer_id: String,
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
}

/// Validate and serialize an event.
///
/// # Errors
///
/// `SchemaViolation` when a payload field is invalid, the producer is blank,
/// or the subject does not carry this event's variant.
pub fn encode(event: &DomainEvent) -> Result<Bytes, GatewayError> {
    check(event)?;

    let data = event
        .payload
        .to_value()
        .map_err(|e| GatewayError::SchemaViolation(e.to_string()))?;
    let envelope = WireEnvelope {
        event_id: event.event_id,
        subject: event.subject.as_str().to_string(),
        occurred_at: event.occurred_at,
        producer_id: event.producer_id.clone(),
        kind: event.kind().as_str().to_string(),
        data,
    };

    serde_json::to_vec(&envelope)
        .map(Bytes::from)
        .map_err(|e| GatewayError::SchemaViolation(e.to_string()))
}

/// Parse and validate an event.
///
/// # Errors
///
/// - `MalformedPayload` when the bytes are not an envelope, the `type` tag
///   disagrees with the subject, or `data` does not fit the variant
/// - `UnknownEventType` when the subject maps to no variant
/// - `SchemaViolation` when the payload parses but breaks a field rule
pub fn decode(bytes: &[u8]) -> Result<DomainEvent, GatewayError> {
    let envelope: WireEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;

    let subject = Subject::new(envelope.subject)
        .map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
    let kind = EventKind::for_subject(&subject)
        .ok_or_else(|| GatewayError::UnknownEventType(subject.to_string()))?;
    if envelope.kind != kind.as_str() {
        return Err(GatewayError::MalformedPayload(format!(
            "type '{}' does not match subject '{subject}' ({kind})",
            envelope.kind
        )));
    }

    let payload = EventPayload::from_value(kind, envelope.data)
        .map_err(|e| GatewayError::MalformedPayload(format!("{kind} data: {e}")))?;

    let event = DomainEvent {
        event_id: envelope.event_id,
        subject,
        occurred_at: envelope.occurred_at,
        producer_id: envelope.producer_id,
        payload,
    };
    check(&event)?;
    Ok(event)
}

fn check(event: &DomainEvent) -> Result<(), GatewayError> {
    if event.producer_id.trim().is_empty() {
        return Err(GatewayError::SchemaViolation(
            "producer_id: must not be empty".to_string(),
        ));
    }
    event
        .payload
        .validate()
        .and_then(|()| event.payload.validate_subject(&event.subject))
        .map_err(|v| GatewayError::SchemaViolation(v.to_string()))
}
