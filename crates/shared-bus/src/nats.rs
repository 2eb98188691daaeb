//! # NATS JetStream Adapter
//!
//! [`StreamBus`] over a NATS server with JetStream enabled.
//!
//! - Streams map 1:1 onto JetStream streams.
//! - Dedup keys travel in the `Nats-Msg-Id` header; the server enforces the
//!   stream's duplicate window.
//! - Consumer groups are durable pull consumers with explicit ack, one per
//!   (filter, group) pair.
//! - JetStream refuses any subject overlap between streams, including
//!   overlaps the in-memory bus accepts because one pattern is more specific.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    context::PublishErrorKind,
    stream,
};
use async_nats::{header, Client, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use shared_types::{
    Compression, RetentionPolicy, StorageClass, StreamDefinition, Subject, SubjectPattern,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::boundary::{
    DeclareOutcome, PublishAck, RawMessage, StreamBus, StreamInfo, StreamStats,
};
use crate::error::BusError;
use crate::DEFAULT_ACK_WAIT;

const ACK_PAYLOAD: &[u8] = b"+ACK";
const NAK_PAYLOAD: &[u8] = b"-NAK";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for [`NatsBus`].
#[derive(Debug, Clone)]
pub struct NatsBusConfig {
    pub url: String,
    pub client_name: Option<String>,
    pub connect_timeout: Duration,
    /// Ack wait configured on every durable consumer the adapter creates.
    pub ack_wait: Duration,
    /// How long a JetStream request (publish ack, stream info) may take.
    pub request_timeout: Duration,
}

impl Default for NatsBusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            client_name: None,
            connect_timeout: Duration::from_secs(5),
            ack_wait: DEFAULT_ACK_WAIT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// JetStream-backed bus.
pub struct NatsBus {
    client: Client,
    jetstream: jetstream::Context,
    consumers: Mutex<HashMap<(String, String), PullConsumer>>,
    ack_wait: Duration,
    request_timeout: Duration,
}

impl NatsBus {
    /// Connect to the server in `config.url`.
    pub async fn connect(config: &NatsBusConfig) -> Result<Self, BusError> {
        let mut options =
            async_nats::ConnectOptions::new().connection_timeout(config.connect_timeout);
        if let Some(name) = &config.client_name {
            options = options.name(name);
        }

        let client = options.connect(config.url.as_str()).await.map_err(|e| {
            BusError::Unavailable(format!("failed to connect to {}: {e}", config.url))
        })?;
        info!(url = %config.url, "Connected to NATS");

        Ok(Self::from_client(client, config.ack_wait)
            .with_request_timeout(config.request_timeout))
    }

    /// Wrap an existing connection.
    #[must_use]
    pub fn from_client(client: Client, ack_wait: Duration) -> Self {
        let mut jetstream = jetstream::new(client.clone());
        jetstream.set_timeout(DEFAULT_REQUEST_TIMEOUT);
        Self {
            client,
            jetstream,
            consumers: Mutex::new(HashMap::new()),
            ack_wait,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Timeout for JetStream requests.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.jetstream.set_timeout(timeout);
        self.request_timeout = timeout;
        self
    }

    /// Round-trip to the server.
    pub async fn flush(&self) -> Result<(), BusError> {
        self.client.flush().await.map_err(unavailable)
    }

    async fn consumer(
        &self,
        filter: &SubjectPattern,
        group: &str,
    ) -> Result<PullConsumer, BusError> {
        let key = (filter.to_string(), group.to_string());
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(&key) {
            return Ok(consumer.clone());
        }

        let stream_name = self
            .jetstream
            .stream_by_subject(filter.as_str())
            .await
            .map_err(|_| BusError::NoStreamForSubject(filter.to_string()))?;
        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|_| BusError::StreamNotFound(stream_name.clone()))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                group,
                pull::Config {
                    durable_name: Some(group.to_string()),
                    filter_subject: filter.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::All,
                    ack_wait: self.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Rejected(format!("consumer '{group}' on {stream_name}: {e}")))?;

        info!(stream = %stream_name, group, filter = %filter, "Durable consumer bound");
        consumers.insert(key, consumer.clone());
        Ok(consumer)
    }

    async fn reply(&self, message: &RawMessage, payload: &'static [u8]) -> Result<(), BusError> {
        let reply = message.reply.clone().ok_or_else(|| BusError::UnknownMessage {
            stream: message.stream.clone(),
            sequence: message.sequence,
        })?;
        self.client
            .publish(reply, Bytes::from_static(payload))
            .await
            .map_err(unavailable)?;
        self.client.flush().await.map_err(unavailable)
    }
}

fn unavailable(err: impl std::fmt::Display) -> BusError {
    BusError::Unavailable(err.to_string())
}

/// JetStream configuration for a definition.
fn stream_config(definition: &StreamDefinition) -> stream::Config {
    stream::Config {
        name: definition.name.clone(),
        subjects: definition.subject_strings(),
        description: definition.description.clone(),
        storage: match definition.storage {
            StorageClass::File => stream::StorageType::File,
            StorageClass::Memory => stream::StorageType::Memory,
        },
        retention: match definition.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
        },
        compression: match definition.compression {
            Compression::None => None,
            Compression::S2 => Some(stream::Compression::S2),
        },
        max_age: definition.max_age,
        max_bytes: i64::try_from(definition.max_bytes).unwrap_or(i64::MAX),
        max_messages: definition
            .max_messages
            .map_or(-1, |m| i64::try_from(m).unwrap_or(i64::MAX)),
        max_message_size: i32::try_from(definition.max_message_size).unwrap_or(i32::MAX),
        num_replicas: usize::from(definition.replicas),
        duplicate_window: definition.duplicate_window,
        discard: stream::DiscardPolicy::Old,
        ..Default::default()
    }
}

/// First field where the server's stream differs from the wanted one.
fn config_mismatch(existing: &stream::Config, wanted: &stream::Config) -> Option<String> {
    let mut existing_subjects = existing.subjects.clone();
    let mut wanted_subjects = wanted.subjects.clone();
    existing_subjects.sort();
    wanted_subjects.sort();
    if existing_subjects != wanted_subjects {
        return Some(format!("subjects {existing_subjects:?} != {wanted_subjects:?}"));
    }
    if existing.storage != wanted.storage {
        return Some(format!("storage {:?} != {:?}", existing.storage, wanted.storage));
    }
    if existing.retention != wanted.retention {
        return Some(format!(
            "retention {:?} != {:?}",
            existing.retention, wanted.retention
        ));
    }
    if existing.max_age != wanted.max_age {
        return Some(format!("max_age {:?} != {:?}", existing.max_age, wanted.max_age));
    }
    if existing.max_bytes != wanted.max_bytes {
        return Some(format!("max_bytes {} != {}", existing.max_bytes, wanted.max_bytes));
    }
    if existing.max_messages != wanted.max_messages {
        return Some(format!(
            "max_messages {} != {}",
            existing.max_messages, wanted.max_messages
        ));
    }
    if existing.max_message_size != wanted.max_message_size {
        return Some(format!(
            "max_message_size {} != {}",
            existing.max_message_size, wanted.max_message_size
        ));
    }
    if existing.num_replicas != wanted.num_replicas {
        return Some(format!(
            "replicas {} != {}",
            existing.num_replicas, wanted.num_replicas
        ));
    }
    if is_s2(existing) != is_s2(wanted) {
        return Some(format!(
            "compression {:?} != {:?}",
            existing.compression, wanted.compression
        ));
    }
    if existing.description != wanted.description {
        return Some(format!(
            "description {:?} != {:?}",
            existing.description, wanted.description
        ));
    }
    if existing.discard != wanted.discard {
        return Some(format!("discard {:?} != {:?}", existing.discard, wanted.discard));
    }
    if existing.duplicate_window != wanted.duplicate_window {
        return Some(format!(
            "duplicate_window {:?} != {:?}",
            existing.duplicate_window, wanted.duplicate_window
        ));
    }
    None
}

/// The server reports an uncompressed stream as `"none"`, not as absent.
fn is_s2(config: &stream::Config) -> bool {
    matches!(config.compression, Some(stream::Compression::S2))
}

fn unix_to_utc(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}

fn to_info(info: &stream::Info) -> StreamInfo {
    let config = &info.config;
    let state = &info.state;
    StreamInfo {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        description: config.description.clone(),
        storage: match config.storage {
            stream::StorageType::Memory => StorageClass::Memory,
            stream::StorageType::File => StorageClass::File,
        },
        retention: match config.retention {
            stream::RetentionPolicy::WorkQueue => RetentionPolicy::WorkQueue,
            stream::RetentionPolicy::Interest => RetentionPolicy::Interest,
            stream::RetentionPolicy::Limits => RetentionPolicy::Limits,
        },
        max_age: config.max_age,
        max_bytes: u64::try_from(config.max_bytes).ok(),
        max_messages: u64::try_from(config.max_messages).ok(),
        max_message_size: u32::try_from(config.max_message_size).ok(),
        replicas: config.num_replicas,
        stats: StreamStats {
            messages: state.messages,
            bytes: state.bytes,
            first_sequence: state.first_sequence,
            last_sequence: state.last_sequence,
            consumer_count: state.consumer_count,
            first_timestamp: (state.messages > 0)
                .then(|| unix_to_utc(state.first_timestamp.unix_timestamp()))
                .flatten(),
            last_timestamp: (state.messages > 0)
                .then(|| unix_to_utc(state.last_timestamp.unix_timestamp()))
                .flatten(),
        },
    }
}

#[async_trait]
impl StreamBus for NatsBus {
    async fn declare_stream(
        &self,
        definition: &StreamDefinition,
    ) -> Result<DeclareOutcome, BusError> {
        let wanted = stream_config(definition);

        if let Ok(mut existing) = self.jetstream.get_stream(&definition.name).await {
            let info = existing.info().await.map_err(unavailable)?;
            return match config_mismatch(&info.config, &wanted) {
                None => {
                    debug!(stream = %definition.name, "Stream already declared");
                    Ok(DeclareOutcome::Unchanged)
                }
                Some(reason) => Err(BusError::StreamConflict {
                    name: definition.name.clone(),
                    reason,
                }),
            };
        }

        self.jetstream.create_stream(wanted).await.map_err(|e| {
            let text = e.to_string();
            if text.contains("overlap") {
                BusError::SubjectOverlap {
                    name: definition.name.clone(),
                    other: text,
                }
            } else if text.contains("already in use") {
                BusError::StreamConflict {
                    name: definition.name.clone(),
                    reason: text,
                }
            } else {
                BusError::Unavailable(text)
            }
        })?;

        info!(stream = %definition, "Stream created");
        Ok(DeclareOutcome::Created)
    }

    async fn publish(
        &self,
        subject: &Subject,
        payload: Bytes,
        dedup_key: Option<&str>,
    ) -> Result<PublishAck, BusError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = dedup_key {
            headers.insert(header::NATS_MESSAGE_ID, key);
        }

        let size = payload.len();
        let max_payload = self.client.server_info().max_payload;
        if size > max_payload {
            return Err(BusError::MessageTooLarge {
                stream: subject.to_string(),
                size,
                max: max_payload,
            });
        }

        let map_publish = |e: jetstream::context::PublishError| match e.kind() {
            PublishErrorKind::TimedOut => BusError::Timeout(self.request_timeout),
            PublishErrorKind::StreamNotFound => BusError::NoStreamForSubject(subject.to_string()),
            _ if e.to_string().contains("exceeds maximum") => BusError::MessageTooLarge {
                stream: subject.to_string(),
                size,
                max: max_payload,
            },
            _ => BusError::Unavailable(e.to_string()),
        };

        let pending = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(map_publish)?;
        let ack = pending.await.map_err(map_publish)?;

        debug!(
            stream = %ack.stream,
            sequence = ack.sequence,
            subject = %subject,
            duplicate = ack.duplicate,
            "Message committed"
        );
        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn pull(
        &self,
        filter: &SubjectPattern,
        group: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, BusError> {
        let consumer = self.consumer(filter, group).await?;
        let mut messages = consumer
            .batch()
            .max_messages(batch.max(1))
            .expires(timeout)
            .messages()
            .await
            .map_err(unavailable)?;

        let mut out = Vec::with_capacity(batch);
        while let Some(next) = messages.next().await {
            let message = next.map_err(unavailable)?;
            let info = message
                .info()
                .map_err(|e| BusError::Rejected(format!("malformed delivery metadata: {e}")))?;
            let dedup_key = message
                .headers
                .as_ref()
                .and_then(|h| h.get(header::NATS_MESSAGE_ID))
                .map(|v| v.as_str().to_string());

            out.push(RawMessage {
                stream: info.stream.to_string(),
                sequence: info.stream_sequence,
                subject: message.subject.to_string(),
                payload: message.payload.clone(),
                consumer_group: group.to_string(),
                delivered: u32::try_from(info.delivered).unwrap_or(u32::MAX),
                dedup_key,
                reply: message.reply.as_ref().map(|r| r.to_string()),
            });
        }
        Ok(out)
    }

    async fn ack(&self, message: &RawMessage) -> Result<(), BusError> {
        self.reply(message, ACK_PAYLOAD).await
    }

    async fn nack(&self, message: &RawMessage) -> Result<(), BusError> {
        self.reply(message, NAK_PAYLOAD).await
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>, BusError> {
        let mut streams = self.jetstream.streams();
        let mut out = Vec::new();
        while let Some(info) = streams.try_next().await.map_err(unavailable)? {
            out.push(to_info(&info));
        }
        Ok(out)
    }

    async fn stream_info(&self, name: &str) -> Result<StreamInfo, BusError> {
        let mut stream = self
            .jetstream
            .get_stream(name)
            .await
            .map_err(|_| BusError::StreamNotFound(name.to_string()))?;
        let info = stream.info().await.map_err(unavailable)?;
        Ok(to_info(info))
    }

    async fn delete_stream(&self, name: &str) -> Result<(), BusError> {
        self.jetstream
            .delete_stream(name)
            .await
            .map_err(|_| BusError::StreamNotFound(name.to_string()))?;
        self.consumers
            .lock()
            .await
            .retain(|_, consumer| consumer.cached_info().stream_name != name);
        warn!(stream = name, "Stream deleted");
        Ok(())
    }
}
