//! # Publisher
//!
//! Encodes a domain event, resolves its stream and waits for the durable
//! commit. There are no internal retries: a transient failure is returned to
//! the caller, who may retry with the same dedup key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shared_bus::{PublishAck, StreamBus};
use shared_types::DomainEvent;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::codec;
use crate::config::PublisherConfig;
use crate::error::GatewayError;
use crate::registry::StreamRegistry;

/// Point-in-time publisher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Events durably committed (duplicates excluded).
    pub published: u64,
    /// Publishes the bus suppressed because the dedup key was already seen.
    pub duplicates: u64,
    /// Publishes that returned an error.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    duplicates: AtomicU64,
    failures: AtomicU64,
}

/// Publishes domain events to their durable stream.
pub struct Publisher<B: StreamBus + ?Sized> {
    bus: Arc<B>,
    registry: Arc<StreamRegistry<B>>,
    publish_timeout: Duration,
    permits: Semaphore,
    counters: Counters,
}

impl<B: StreamBus + ?Sized> Publisher<B> {
    pub fn new(registry: Arc<StreamRegistry<B>>, config: &PublisherConfig) -> Self {
        Self {
            bus: registry.bus().clone(),
            registry,
            publish_timeout: config.publish_timeout,
            permits: Semaphore::new(config.max_in_flight),
            counters: Counters::default(),
        }
    }

    /// Publish `event`, waiting for the bus to confirm the durable commit.
    ///
    /// # Errors
    ///
    /// - `SchemaViolation` / `NoMatchingStream` / `PayloadTooLarge`: fatal
    ///   for this event
    /// - `BusUnavailable` / `PublishTimeout`: transient; retry with the same
    ///   `dedup_key` to stay idempotent
    pub async fn publish(
        &self,
        event: &DomainEvent,
        dedup_key: Option<&str>,
    ) -> Result<PublishAck, GatewayError> {
        let result = self.try_publish(event, dedup_key).await;
        match &result {
            Ok(ack) if ack.duplicate => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subject = %event.subject,
                    event_id = %event.event_id,
                    class = %e.class(),
                    error = %e,
                    "Publish failed"
                );
            }
        }
        result
    }

    /// Publish using the event's own id as the dedup key.
    pub async fn publish_with_event_id(
        &self,
        event: &DomainEvent,
    ) -> Result<PublishAck, GatewayError> {
        let key = event.event_id.to_string();
        self.publish(event, Some(&key)).await
    }

    #[must_use]
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.counters.published.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Free in-flight slots.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn try_publish(
        &self,
        event: &DomainEvent,
        dedup_key: Option<&str>,
    ) -> Result<PublishAck, GatewayError> {
        let payload = codec::encode(event)?;
        let stream = self.registry.resolve(&event.subject)?;

        let max = stream.max_message_size as usize;
        if payload.len() > max {
            return Err(GatewayError::PayloadTooLarge {
                stream: stream.name,
                size: payload.len(),
                max,
            });
        }

        let _permit = tokio::time::timeout(self.publish_timeout, self.permits.acquire())
            .await
            .map_err(|_| GatewayError::PublishTimeout(self.publish_timeout))?
            .map_err(|_| GatewayError::BusUnavailable("publisher is closed".to_string()))?;

        let ack = tokio::time::timeout(
            self.publish_timeout,
            self.bus.publish(&event.subject, payload, dedup_key),
        )
        .await
        .map_err(|_| GatewayError::PublishTimeout(self.publish_timeout))??;

        debug!(
            stream = %ack.stream,
            sequence = ack.sequence,
            subject = %event.subject,
            event_id = %event.event_id,
            duplicate = ack.duplicate,
            "Event published"
        );
        Ok(ack)
    }
}
