//! # Bus Boundary
//!
//! The only surface through which the gateway talks to the message bus.
//! Everything the registry, publisher and consumer need is expressed here;
//! the bus itself (durable storage, replication, dedup) is external.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use shared_types::{
    RetentionPolicy, StorageClass, StreamDefinition, Subject, SubjectPattern,
};

use crate::error::BusError;

/// Result of declaring a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareOutcome {
    /// The stream did not exist and was created.
    Created,
    /// An identical stream already existed; nothing changed.
    Unchanged,
}

/// Confirmation of a durable commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream that stored the message.
    pub stream: String,
    /// Sequence number assigned by the stream.
    pub sequence: u64,
    /// True when the bus suppressed the write because the dedup key was
    /// already seen inside the stream's window.
    pub duplicate: bool,
}

/// A message handed out by [`StreamBus::pull`].
///
/// It is acknowledged or negatively acknowledged by passing it back to the
/// same bus.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub stream: String,
    pub sequence: u64,
    pub subject: String,
    pub payload: Bytes,
    pub consumer_group: String,
    /// 1 on first delivery, incremented on each redelivery.
    pub delivered: u32,
    pub dedup_key: Option<String>,
    pub(crate) reply: Option<String>,
}

impl RawMessage {
    /// Build a message that is not bound to any bus ack handle.
    #[must_use]
    pub fn new(
        stream: impl Into<String>,
        sequence: u64,
        subject: impl Into<String>,
        payload: Bytes,
        consumer_group: impl Into<String>,
        delivered: u32,
    ) -> Self {
        Self {
            stream: stream.into(),
            sequence,
            subject: subject.into(),
            payload,
            consumer_group: consumer_group.into(),
            delivered,
            dedup_key: None,
            reply: None,
        }
    }

    /// Has this message been delivered before?
    #[must_use]
    pub fn is_redelivery(&self) -> bool {
        self.delivered > 1
    }
}

/// Current counters of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumer_count: usize,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

/// Configuration and state of a stream as reported by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub subjects: Vec<String>,
    pub description: Option<String>,
    pub storage: StorageClass,
    pub retention: RetentionPolicy,
    pub max_age: Duration,
    /// `None` means unlimited.
    pub max_bytes: Option<u64>,
    pub max_messages: Option<u64>,
    pub max_message_size: Option<u32>,
    pub replicas: usize,
    pub stats: StreamStats,
}

/// Subject-based durable pub/sub with pull consumption and explicit acks.
#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Create a stream, or confirm an identical one already exists.
    ///
    /// # Errors
    ///
    /// `BusError::StreamConflict` when a stream of the same name exists with
    /// a different configuration. The existing stream is never modified.
    async fn declare_stream(&self, definition: &StreamDefinition)
        -> Result<DeclareOutcome, BusError>;

    /// Durably append a message and wait for the commit.
    ///
    /// When `dedup_key` is set and was already used inside the stream's
    /// duplicate window, nothing is stored and the ack has `duplicate = true`.
    async fn publish(
        &self,
        subject: &Subject,
        payload: Bytes,
        dedup_key: Option<&str>,
    ) -> Result<PublishAck, BusError>;

    /// Fetch up to `batch` messages matching `filter` for `group`, waiting at
    /// most `timeout`. An empty vector means the wait elapsed idle.
    async fn pull(
        &self,
        filter: &SubjectPattern,
        group: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, BusError>;

    /// Confirm processing; the message will not be delivered to `group` again.
    async fn ack(&self, message: &RawMessage) -> Result<(), BusError>;

    /// Reject processing; the message becomes eligible for redelivery now.
    async fn nack(&self, message: &RawMessage) -> Result<(), BusError>;

    /// All streams with their current state.
    async fn list_streams(&self) -> Result<Vec<StreamInfo>, BusError>;

    /// One stream's configuration and state.
    async fn stream_info(&self, name: &str) -> Result<StreamInfo, BusError>;

    /// Remove a stream and all its messages. Test/ephemeral streams only.
    async fn delete_stream(&self, name: &str) -> Result<(), BusError>;
}
