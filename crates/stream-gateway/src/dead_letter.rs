//! # Dead Letter Routing
//!
//! Messages that can never succeed, or that exhausted their delivery budget,
//! are republished to the dead-letter stream under `<prefix>.<original subject>`
//! together with enough metadata to inspect or replay them.
//!
//! The original payload is hex encoded, so an entry is more than twice the
//! size of the message it carries. When the dead-letter stream rejects an
//! entry as too large, it is stored again without the payload and marked
//! `payload_truncated`; the message must still leave its source stream.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_bus::{PublishAck, RawMessage, StreamBus};
use shared_types::Subject;
use tracing::{error, warn};

use crate::error::GatewayError;

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The handler failed on the final allowed delivery.
    HandlerFailed,
    /// No handler is registered and the policy routes such messages here.
    Unroutable,
    /// The payload could not be decoded into a domain event.
    Undecodable,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeadLetterReason::HandlerFailed => "handler_failed",
            DeadLetterReason::Unroutable => "unroutable",
            DeadLetterReason::Undecodable => "undecodable",
        })
    }
}

/// A dead-lettered message and its failure context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Stream the message was read from.
    pub stream: String,
    /// Sequence in that stream.
    pub sequence: u64,
    /// Subject the message was published to.
    pub subject: String,
    /// Consumer group that gave up on it.
    pub consumer_group: String,
    /// Deliveries made before giving up.
    pub deliveries: u32,
    pub reason: DeadLetterReason,
    /// Error text from the last attempt.
    pub error: String,
    /// Original payload bytes, hex encoded. Empty when truncated.
    pub payload_hex: String,
    /// Size of the original payload in bytes.
    #[serde(default)]
    pub payload_size: usize,
    /// The payload did not fit the dead-letter stream and was dropped.
    #[serde(default)]
    pub payload_truncated: bool,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    #[must_use]
    pub fn from_message(
        message: &RawMessage,
        reason: DeadLetterReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            stream: message.stream.clone(),
            sequence: message.sequence,
            subject: message.subject.clone(),
            consumer_group: message.consumer_group.clone(),
            deliveries: message.delivered,
            reason,
            error: error.into(),
            payload_hex: hex::encode(&message.payload),
            payload_size: message.payload.len(),
            payload_truncated: false,
            dead_lettered_at: Utc::now(),
        }
    }

    /// Same entry without the payload bytes.
    #[must_use]
    pub fn truncated(&self) -> Self {
        Self {
            payload_hex: String::new(),
            payload_truncated: true,
            ..self.clone()
        }
    }

    /// The original payload bytes; empty when truncated.
    pub fn original_payload(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.payload_hex)
    }

    /// Stable key: one entry per (stream, sequence, group), however many times
    /// the dead-lettering itself is retried.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.stream, self.sequence, self.consumer_group)
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Publishes [`DeadLetterEntry`] records to the dead-letter stream.
pub struct DeadLetterSink<B: StreamBus + ?Sized> {
    bus: Arc<B>,
    prefix: String,
}

impl<B: StreamBus + ?Sized> Clone for DeadLetterSink<B> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            prefix: self.prefix.clone(),
        }
    }
}

impl<B: StreamBus + ?Sized> DeadLetterSink<B> {
    pub fn new(bus: Arc<B>, prefix: impl Into<String>) -> Self {
        Self {
            bus,
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `<prefix>.<original>`.
    pub fn subject_for(&self, original: &str) -> Result<Subject, GatewayError> {
        Subject::new(format!("{}.{original}", self.prefix))
            .map_err(|e| GatewayError::SchemaViolation(e.to_string()))
    }

    /// Publish `entry`; safe to retry thanks to its dedup key.
    ///
    /// An entry the stream rejects as too large is retried once without its
    /// payload.
    pub async fn send(&self, entry: &DeadLetterEntry) -> Result<PublishAck, GatewayError> {
        let subject = self.subject_for(&entry.subject)?;
        let (ack, entry) = match self.publish(&subject, entry).await {
            Err(GatewayError::PayloadTooLarge { size, max, .. }) if !entry.payload_truncated => {
                warn!(
                    stream = %entry.stream,
                    sequence = entry.sequence,
                    entry_size = size,
                    max,
                    "Dead-letter entry too large; storing it without the payload"
                );
                let truncated = entry.truncated();
                (self.publish(&subject, &truncated).await?, truncated)
            }
            result => (result?, entry.clone()),
        };

        error!(
            stream = %entry.stream,
            sequence = entry.sequence,
            subject = %entry.subject,
            group = %entry.consumer_group,
            deliveries = entry.deliveries,
            reason = %entry.reason,
            error = %entry.error,
            truncated = entry.payload_truncated,
            dlq_sequence = ack.sequence,
            "Message dead-lettered"
        );
        Ok(ack)
    }

    async fn publish(
        &self,
        subject: &Subject,
        entry: &DeadLetterEntry,
    ) -> Result<PublishAck, GatewayError> {
        let payload = entry
            .to_bytes()
            .map_err(|e| GatewayError::SchemaViolation(e.to_string()))?;
        Ok(self
            .bus
            .publish(subject, payload, Some(&entry.dedup_key()))
            .await?)
    }
}
