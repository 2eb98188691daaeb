//! # In-Memory Durable Bus
//!
//! A process-local [`StreamBus`] with the delivery semantics of a durable
//! broker: per-stream sequences, a dedup window, per-group cursors, ack wait
//! with redelivery, and retention by age, bytes and message count.
//!
//! Suitable for tests and single-process runs; multi-node deployments use
//! [`NatsBus`](crate::NatsBus).
//!
//! Streams may overlap when one pattern is strictly more specific (say
//! `orders.>` and `orders.*`); the more specific stream captures the subject.
//! JetStream refuses such a pair, so a set of streams meant for
//! [`NatsBus`](crate::NatsBus) must not overlap at all.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared_types::{StreamDefinition, Subject, SubjectPattern};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::boundary::{
    DeclareOutcome, PublishAck, RawMessage, StreamBus, StreamInfo, StreamStats,
};
use crate::dedup_cache::DedupWindow;
use crate::error::BusError;
use crate::DEFAULT_ACK_WAIT;

/// A message as stored in a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub sequence: u64,
    pub subject: String,
    pub payload: Bytes,
    pub dedup_key: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    message: StoredMessage,
    stored_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct PendingDelivery {
    delivered: u32,
    redeliver_at: Instant,
}

/// Cursor and outstanding deliveries of one consumer group.
#[derive(Debug)]
struct GroupState {
    filter: SubjectPattern,
    next_sequence: u64,
    pending: BTreeMap<u64, PendingDelivery>,
}

#[derive(Debug)]
struct StreamState {
    definition: StreamDefinition,
    entries: VecDeque<Entry>,
    bytes: u64,
    last_sequence: u64,
    dedup: DedupWindow,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn new(definition: StreamDefinition, now: Instant) -> Self {
        let dedup = DedupWindow::new(definition.duplicate_window, now);
        Self {
            definition,
            entries: VecDeque::new(),
            bytes: 0,
            last_sequence: 0,
            dedup,
            groups: HashMap::new(),
        }
    }

    fn append(
        &mut self,
        subject: &Subject,
        payload: Bytes,
        dedup_key: Option<&str>,
        now: Instant,
    ) -> Result<PublishAck, BusError> {
        let max = self.definition.max_message_size as usize;
        if payload.len() > max {
            return Err(BusError::MessageTooLarge {
                stream: self.definition.name.clone(),
                size: payload.len(),
                max,
            });
        }

        if let Some(key) = dedup_key {
            if let Some(sequence) = self.dedup.lookup(key, now) {
                return Ok(PublishAck {
                    stream: self.definition.name.clone(),
                    sequence,
                    duplicate: true,
                });
            }
        }

        self.last_sequence += 1;
        let sequence = self.last_sequence;
        if let Some(key) = dedup_key {
            self.dedup.record(key, sequence, now);
        }

        self.bytes += payload.len() as u64;
        self.entries.push_back(Entry {
            message: StoredMessage {
                sequence,
                subject: subject.as_str().to_string(),
                payload,
                dedup_key: dedup_key.map(str::to_string),
                timestamp: Utc::now(),
            },
            stored_at: now,
        });
        self.enforce_limits(now);

        Ok(PublishAck {
            stream: self.definition.name.clone(),
            sequence,
            duplicate: false,
        })
    }

    /// Discard the oldest messages until every limit holds.
    fn enforce_limits(&mut self, now: Instant) {
        let max_age = self.definition.max_age;
        let max_bytes = self.definition.max_bytes;
        let max_messages = self.definition.max_messages;

        while let Some(front) = self.entries.front() {
            let expired = now.saturating_duration_since(front.stored_at) >= max_age;
            let over_bytes = self.bytes > max_bytes;
            let over_count = max_messages.is_some_and(|max| self.entries.len() as u64 > max);
            if !(expired || over_bytes || over_count) {
                break;
            }
            if let Some(removed) = self.entries.pop_front() {
                self.bytes -= removed.message.payload.len() as u64;
            }
        }
    }

    fn remove(&mut self, sequence: u64) {
        if let Ok(index) = self
            .entries
            .binary_search_by_key(&sequence, |e| e.message.sequence)
        {
            if let Some(removed) = self.entries.remove(index) {
                self.bytes -= removed.message.payload.len() as u64;
            }
        }
    }

    fn stats(&self) -> StreamStats {
        StreamStats {
            messages: self.entries.len() as u64,
            bytes: self.bytes,
            first_sequence: self
                .entries
                .front()
                .map_or(self.last_sequence + 1, |e| e.message.sequence),
            last_sequence: self.last_sequence,
            consumer_count: self.groups.len(),
            first_timestamp: self.entries.front().map(|e| e.message.timestamp),
            last_timestamp: self.entries.back().map(|e| e.message.timestamp),
        }
    }

    fn info(&self) -> StreamInfo {
        let def = &self.definition;
        StreamInfo {
            name: def.name.clone(),
            subjects: def.subject_strings(),
            description: def.description.clone(),
            storage: def.storage,
            retention: def.retention,
            max_age: def.max_age,
            max_bytes: Some(def.max_bytes),
            max_messages: def.max_messages,
            max_message_size: Some(def.max_message_size),
            replicas: usize::from(def.replicas),
            stats: self.stats(),
        }
    }
}

fn find(entries: &VecDeque<Entry>, sequence: u64) -> Option<&StoredMessage> {
    entries
        .binary_search_by_key(&sequence, |e| e.message.sequence)
        .ok()
        .and_then(|index| entries.get(index))
        .map(|e| &e.message)
}

fn to_raw(stream: &str, group: &str, message: &StoredMessage, delivered: u32) -> RawMessage {
    RawMessage {
        stream: stream.to_string(),
        sequence: message.sequence,
        subject: message.subject.clone(),
        payload: message.payload.clone(),
        consumer_group: group.to_string(),
        delivered,
        dedup_key: message.dedup_key.clone(),
        reply: None,
    }
}

/// Messages handed out by one pull attempt.
struct Batch {
    messages: Vec<RawMessage>,
    /// Earliest moment an outstanding delivery becomes due again.
    next_redelivery: Option<Instant>,
}

#[derive(Debug, Default)]
struct BusState {
    streams: BTreeMap<String, StreamState>,
}

impl BusState {
    /// Stream whose most specific matching pattern is the most specific overall.
    fn stream_for_subject(&self, subject: &Subject) -> Option<String> {
        self.streams
            .values()
            .filter_map(|s| {
                s.definition
                    .subjects
                    .iter()
                    .filter(|p| p.matches(subject))
                    .map(SubjectPattern::specificity)
                    .max()
                    .map(|rank| (rank, &s.definition.name))
            })
            .max_by_key(|(rank, _)| *rank)
            .map(|(_, name)| name.clone())
    }

    /// Stream able to serve every subject `filter` can match.
    fn stream_for_filter(&self, filter: &SubjectPattern) -> Option<String> {
        self.streams
            .values()
            .filter_map(|s| {
                s.definition
                    .subjects
                    .iter()
                    .filter(|p| p.covers(filter))
                    .map(SubjectPattern::specificity)
                    .max()
                    .map(|rank| (rank, &s.definition.name))
            })
            .max_by_key(|(rank, _)| *rank)
            .map(|(_, name)| name.clone())
    }

    fn stream_mut(&mut self, name: &str) -> Result<&mut StreamState, BusError> {
        self.streams
            .get_mut(name)
            .ok_or_else(|| BusError::StreamNotFound(name.to_string()))
    }
}

/// In-memory implementation of [`StreamBus`].
pub struct InMemoryBus {
    state: Mutex<BusState>,

    /// Woken on every stored message and every nack.
    arrivals: Notify,

    /// When false every operation fails with `BusError::Unavailable`.
    online: AtomicBool,

    /// How long a delivered message may stay unacknowledged before redelivery.
    ack_wait: Duration,

    messages_published: AtomicU64,
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ack_wait(DEFAULT_ACK_WAIT)
    }

    #[must_use]
    pub fn with_ack_wait(ack_wait: Duration) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            arrivals: Notify::new(),
            online: AtomicBool::new(true),
            ack_wait,
            messages_published: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if online {
            self.arrivals.notify_waiters();
        }
        info!(online, "In-memory bus availability changed");
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn ack_wait(&self) -> Duration {
        self.ack_wait
    }

    /// Messages durably stored (duplicates excluded).
    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Snapshot of a stream's retained messages, oldest first.
    pub fn messages(&self, stream: &str) -> Result<Vec<StoredMessage>, BusError> {
        let state = self.state.lock();
        let stream = state
            .streams
            .get(stream)
            .ok_or_else(|| BusError::StreamNotFound(stream.to_string()))?;
        Ok(stream.entries.iter().map(|e| e.message.clone()).collect())
    }

    /// Deliveries handed to `group` and not yet acknowledged.
    #[must_use]
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        let state = self.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    fn ensure_online(&self) -> Result<(), BusError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(BusError::Unavailable("in-memory bus is offline".to_string()))
        }
    }

    fn take_batch(
        &self,
        filter: &SubjectPattern,
        group: &str,
        max: usize,
        now: Instant,
    ) -> Result<Batch, BusError> {
        let ack_wait = self.ack_wait;
        let mut state = self.state.lock();
        let name = state
            .stream_for_filter(filter)
            .ok_or_else(|| BusError::NoStreamForSubject(filter.to_string()))?;
        let stream = state.stream_mut(&name)?;
        stream.enforce_limits(now);

        let entries = &stream.entries;
        let group_state = stream
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                filter: filter.clone(),
                next_sequence: 1,
                pending: BTreeMap::new(),
            });
        if group_state.filter != *filter {
            return Err(BusError::Rejected(format!(
                "consumer group '{group}' is bound to filter '{}'",
                group_state.filter
            )));
        }

        let mut messages = Vec::new();

        // Overdue deliveries first, oldest sequence first.
        let due: Vec<u64> = group_state
            .pending
            .iter()
            .filter(|(_, p)| p.redeliver_at <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for sequence in due {
            if messages.len() >= max {
                break;
            }
            let Some(message) = find(entries, sequence) else {
                // Discarded by retention while outstanding.
                group_state.pending.remove(&sequence);
                continue;
            };
            if let Some(pending) = group_state.pending.get_mut(&sequence) {
                pending.delivered = pending.delivered.saturating_add(1);
                pending.redeliver_at = now + ack_wait;
                messages.push(to_raw(&name, group, message, pending.delivered));
            }
        }

        let start = group_state.next_sequence;
        for entry in entries.iter().filter(|e| e.message.sequence >= start) {
            if messages.len() >= max {
                break;
            }
            let message = &entry.message;
            group_state.next_sequence = message.sequence + 1;
            let Ok(subject) = Subject::new(message.subject.as_str()) else {
                continue;
            };
            if !filter.matches(&subject) {
                continue;
            }
            group_state.pending.insert(
                message.sequence,
                PendingDelivery {
                    delivered: 1,
                    redeliver_at: now + ack_wait,
                },
            );
            messages.push(to_raw(&name, group, message, 1));
        }

        let next_redelivery = group_state.pending.values().map(|p| p.redeliver_at).min();
        Ok(Batch {
            messages,
            next_redelivery,
        })
    }

    fn settle(&self, message: &RawMessage, requeue: bool) -> Result<(), BusError> {
        self.ensure_online()?;
        let mut state = self.state.lock();
        let stream = state.stream_mut(&message.stream)?;
        let work_queue = stream.definition.retention == shared_types::RetentionPolicy::WorkQueue;

        let group = stream
            .groups
            .get_mut(&message.consumer_group)
            .ok_or_else(|| BusError::UnknownMessage {
                stream: message.stream.clone(),
                sequence: message.sequence,
            })?;

        if requeue {
            match group.pending.get_mut(&message.sequence) {
                Some(pending) => pending.redeliver_at = Instant::now(),
                None => {
                    return Err(BusError::UnknownMessage {
                        stream: message.stream.clone(),
                        sequence: message.sequence,
                    })
                }
            }
        } else if group.pending.remove(&message.sequence).is_some() && work_queue {
            stream.remove(message.sequence);
        }
        Ok(())
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamBus for InMemoryBus {
    async fn declare_stream(
        &self,
        definition: &StreamDefinition,
    ) -> Result<DeclareOutcome, BusError> {
        self.ensure_online()?;
        definition
            .validate()
            .map_err(|e| BusError::Rejected(e.to_string()))?;

        let mut state = self.state.lock();
        if let Some(existing) = state.streams.get(&definition.name) {
            if existing.definition == *definition {
                debug!(stream = %definition.name, "Stream already declared");
                return Ok(DeclareOutcome::Unchanged);
            }
            return Err(BusError::StreamConflict {
                name: definition.name.clone(),
                reason: describe_difference(&existing.definition, definition),
            });
        }

        for other in state.streams.values() {
            let collides = definition.subjects.iter().any(|p| {
                other
                    .definition
                    .subjects
                    .iter()
                    .any(|q| p.overlaps(q) && p.specificity() == q.specificity())
            });
            if collides {
                return Err(BusError::SubjectOverlap {
                    name: definition.name.clone(),
                    other: other.definition.name.clone(),
                });
            }
        }

        state.streams.insert(
            definition.name.clone(),
            StreamState::new(definition.clone(), Instant::now()),
        );
        info!(stream = %definition, "Stream created");
        Ok(DeclareOutcome::Created)
    }

    async fn publish(
        &self,
        subject: &Subject,
        payload: Bytes,
        dedup_key: Option<&str>,
    ) -> Result<PublishAck, BusError> {
        self.ensure_online()?;
        let ack = {
            let mut state = self.state.lock();
            let name = state
                .stream_for_subject(subject)
                .ok_or_else(|| BusError::NoStreamForSubject(subject.to_string()))?;
            state
                .stream_mut(&name)?
                .append(subject, payload, dedup_key, Instant::now())?
        };

        if ack.duplicate {
            debug!(
                stream = %ack.stream,
                sequence = ack.sequence,
                subject = %subject,
                "Duplicate publish suppressed"
            );
        } else {
            self.messages_published.fetch_add(1, Ordering::Relaxed);
            self.arrivals.notify_waiters();
            debug!(
                stream = %ack.stream,
                sequence = ack.sequence,
                subject = %subject,
                "Message stored"
            );
        }
        Ok(ack)
    }

    async fn pull(
        &self,
        filter: &SubjectPattern,
        group: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, BusError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.ensure_online()?;

            // Register interest before looking so a concurrent publish is not missed.
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let Batch {
                messages,
                next_redelivery,
            } = self.take_batch(filter, group, batch.max(1), now)?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            let wake_at = next_redelivery
                .map(|at| tokio::time::Instant::from_std(at).min(deadline))
                .unwrap_or(deadline);
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, message: &RawMessage) -> Result<(), BusError> {
        self.settle(message, false)
    }

    async fn nack(&self, message: &RawMessage) -> Result<(), BusError> {
        self.settle(message, true)?;
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>, BusError> {
        self.ensure_online()?;
        let state = self.state.lock();
        Ok(state.streams.values().map(StreamState::info).collect())
    }

    async fn stream_info(&self, name: &str) -> Result<StreamInfo, BusError> {
        self.ensure_online()?;
        let mut state = self.state.lock();
        let stream = state.stream_mut(name)?;
        stream.enforce_limits(Instant::now());
        Ok(stream.info())
    }

    async fn delete_stream(&self, name: &str) -> Result<(), BusError> {
        self.ensure_online()?;
        let removed = self.state.lock().streams.remove(name);
        match removed {
            Some(_) => {
                warn!(stream = name, "Stream deleted");
                Ok(())
            }
            None => Err(BusError::StreamNotFound(name.to_string())),
        }
    }
}

/// First configuration field that differs, for conflict messages.
pub(crate) fn describe_difference(existing: &StreamDefinition, wanted: &StreamDefinition) -> String {
    if existing.subjects != wanted.subjects {
        return format!(
            "subjects {:?} != {:?}",
            existing.subject_strings(),
            wanted.subject_strings()
        );
    }
    if existing.storage != wanted.storage {
        return format!("storage {:?} != {:?}", existing.storage, wanted.storage);
    }
    if existing.retention != wanted.retention {
        return format!("retention {:?} != {:?}", existing.retention, wanted.retention);
    }
    if existing.max_age != wanted.max_age {
        return format!("max_age {:?} != {:?}", existing.max_age, wanted.max_age);
    }
    if existing.max_bytes != wanted.max_bytes {
        return format!("max_bytes {} != {}", existing.max_bytes, wanted.max_bytes);
    }
    if existing.replicas != wanted.replicas {
        return format!("replicas {} != {}", existing.replicas, wanted.replicas);
    }
    "configuration differs".to_string()
}
