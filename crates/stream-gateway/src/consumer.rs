//! # Durable Consumer
//!
//! Pull loop for one (consumer group, subject filter) pair.
//!
//! ```text
//!   Disconnected ──connect──→ Fetching ──batch──→ Processing ──→ Acknowledging
//!        ↑                       ↑  │ idle                            │
//!        └──── fetch error ──────┘  └─────────────────────────────────┘
//! ```
//!
//! Acknowledgment happens strictly after the handler succeeds, so a crash
//! between the two redelivers the message. A failing message is left for
//! redelivery until it has been delivered `max_deliveries` times, then it is
//! moved to the dead-letter stream.

use std::fmt;
use std::sync::Arc;

use shared_bus::{RawMessage, StreamBus};
use shared_types::{DomainEvent, SubjectPattern};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::codec;
use crate::config::{ConsumerConfig, UnroutablePolicy};
use crate::dead_letter::{DeadLetterEntry, DeadLetterReason, DeadLetterSink};
use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;

/// Where the consumer is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    Disconnected,
    Fetching,
    Processing,
    Acknowledging,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Fetching => "fetching",
            ConsumerState::Processing => "processing",
            ConsumerState::Acknowledging => "acknowledging",
        })
    }
}

/// Outcome of one fetch/process/ack cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages returned by the fetch.
    pub fetched: usize,
    /// Messages acknowledged after successful handling (or unroutable-ack).
    pub acked: usize,
    /// Messages negatively acknowledged for redelivery.
    pub redelivery_requested: usize,
    /// Messages moved to the dead-letter stream.
    pub dead_lettered: usize,
    /// Shutdown was observed before the batch was finished.
    pub interrupted: bool,
}

impl BatchReport {
    /// True when the fetch came back empty.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.fetched == 0 && !self.interrupted
    }

    fn absorb(&mut self, other: &BatchReport) {
        self.fetched += other.fetched;
        self.acked += other.acked;
        self.redelivery_requested += other.redelivery_requested;
        self.dead_lettered += other.dead_lettered;
        self.interrupted |= other.interrupted;
    }
}

/// What to do with a message once processing is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    Redeliver,
    DeadLettered,
}

/// At-least-once consumer bound to one group and filter.
pub struct DurableConsumer<B: StreamBus + ?Sized> {
    bus: Arc<B>,
    filter: SubjectPattern,
    dispatcher: Arc<Dispatcher>,
    dead_letter: DeadLetterSink<B>,
    config: ConsumerConfig,
    state: ConsumerState,
    backoff: Backoff,
    shutdown: Option<watch::Receiver<bool>>,
    totals: BatchReport,
}

impl<B: StreamBus + ?Sized> DurableConsumer<B> {
    pub fn new(
        bus: Arc<B>,
        filter: SubjectPattern,
        dispatcher: Arc<Dispatcher>,
        dead_letter: DeadLetterSink<B>,
        config: ConsumerConfig,
    ) -> Self {
        let backoff = Backoff::new(config.backoff);
        Self {
            bus,
            filter,
            dispatcher,
            dead_letter,
            config,
            state: ConsumerState::Disconnected,
            backoff,
            shutdown: None,
            totals: BatchReport::default(),
        }
    }

    /// Observe `shutdown` between messages and while waiting on a fetch.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.state
    }

    #[must_use]
    pub fn filter(&self) -> &SubjectPattern {
        &self.filter
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.config.group
    }

    /// Sum of every batch report so far.
    #[must_use]
    pub fn totals(&self) -> BatchReport {
        self.totals
    }

    /// One fetch/process/ack cycle.
    ///
    /// Messages left unprocessed because of shutdown are neither acked nor
    /// nacked; the bus redelivers them after its ack wait.
    ///
    /// # Errors
    ///
    /// Returns the fetch error; the consumer is then `Disconnected`.
    pub async fn poll_once(&mut self) -> Result<BatchReport, GatewayError> {
        let mut report = BatchReport::default();
        if self.shutdown_requested() {
            report.interrupted = true;
            return Ok(report);
        }

        self.state = ConsumerState::Fetching;
        let fetch = self.bus.pull(
            &self.filter,
            &self.config.group,
            self.config.batch_size,
            self.config.fetch_timeout,
        );
        let fetched = match self.shutdown.as_mut() {
            Some(shutdown) => tokio::select! {
                result = fetch => result,
                _ = wait_for_shutdown(shutdown) => {
                    report.interrupted = true;
                    return Ok(report);
                }
            },
            None => fetch.await,
        };
        let messages = match fetched {
            Ok(messages) => messages,
            Err(e) => {
                self.state = ConsumerState::Disconnected;
                return Err(e.into());
            }
        };

        report.fetched = messages.len();
        for message in &messages {
            if self.shutdown_requested() {
                report.interrupted = true;
                break;
            }

            self.state = ConsumerState::Processing;
            let disposition = self.process(message).await;

            self.state = ConsumerState::Acknowledging;
            match disposition {
                Disposition::Ack => {
                    if self.settle(message, true).await {
                        report.acked += 1;
                    }
                }
                Disposition::DeadLettered => {
                    self.settle(message, true).await;
                    report.dead_lettered += 1;
                }
                Disposition::Redeliver => {
                    self.settle(message, false).await;
                    report.redelivery_requested += 1;
                }
            }
        }

        self.state = ConsumerState::Fetching;
        self.totals.absorb(&report);
        Ok(report)
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Transient failures back off exponentially and retry; anything else
    /// stops the loop with the error.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<BatchReport, GatewayError> {
        self.shutdown = Some(shutdown);
        info!(filter = %self.filter, group = %self.config.group, "Consumer started");

        loop {
            match self.poll_once().await {
                Ok(report) => {
                    self.backoff.reset();
                    if report.interrupted {
                        break;
                    }
                    if !report.is_idle() {
                        debug!(
                            filter = %self.filter,
                            fetched = report.fetched,
                            acked = report.acked,
                            redelivery = report.redelivery_requested,
                            dead_lettered = report.dead_lettered,
                            "Batch processed"
                        );
                    }
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        filter = %self.filter,
                        group = %self.config.group,
                        attempt = self.backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Fetch failed; reconnecting"
                    );
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(
                        filter = %self.filter,
                        group = %self.config.group,
                        class = %e.class(),
                        error = %e,
                        "Consumer stopped on fatal error"
                    );
                    self.state = ConsumerState::Disconnected;
                    return Err(e);
                }
            }
        }

        self.state = ConsumerState::Disconnected;
        info!(
            filter = %self.filter,
            group = %self.config.group,
            acked = self.totals.acked,
            dead_lettered = self.totals.dead_lettered,
            "Consumer stopped"
        );
        Ok(self.totals)
    }

    async fn process(&self, message: &RawMessage) -> Disposition {
        let event = match decode_delivery(message) {
            Ok(event) => event,
            Err(e) => {
                return self
                    .dead_letter(message, DeadLetterReason::Undecodable, e.to_string())
                    .await
            }
        };

        match self.dispatcher.dispatch(&event).await {
            Ok(handler) => {
                debug!(
                    handler = %handler,
                    subject = %event.subject,
                    event_id = %event.event_id,
                    delivered = message.delivered,
                    "Event handled"
                );
                Disposition::Ack
            }
            Err(e @ GatewayError::NoHandlerRegistered(_)) => match self.config.unroutable {
                UnroutablePolicy::Acknowledge => {
                    warn!(
                        subject = %event.subject,
                        event_id = %event.event_id,
                        "No handler registered; acknowledging"
                    );
                    Disposition::Ack
                }
                UnroutablePolicy::DeadLetter => {
                    self.dead_letter(message, DeadLetterReason::Unroutable, e.to_string())
                        .await
                }
            },
            Err(e) if message.delivered >= self.config.max_deliveries => {
                self.dead_letter(message, DeadLetterReason::HandlerFailed, e.to_string())
                    .await
            }
            Err(e) => {
                error!(
                    subject = %event.subject,
                    event_id = %event.event_id,
                    delivered = message.delivered,
                    max_deliveries = self.config.max_deliveries,
                    error = %e,
                    "Handler failed; requesting redelivery"
                );
                Disposition::Redeliver
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &RawMessage,
        reason: DeadLetterReason,
        error: String,
    ) -> Disposition {
        let entry = DeadLetterEntry::from_message(message, reason, error);
        match self.dead_letter.send(&entry).await {
            Ok(_) => Disposition::DeadLettered,
            Err(e) => {
                // The original must stay on its stream until the entry is stored.
                warn!(
                    stream = %message.stream,
                    sequence = message.sequence,
                    reason = %reason,
                    error = %e,
                    "Dead-letter publish failed; requesting redelivery"
                );
                Disposition::Redeliver
            }
        }
    }

    /// Ack (`positive`) or nack; failures are logged and left to redelivery.
    async fn settle(&self, message: &RawMessage, positive: bool) -> bool {
        let result = if positive {
            self.bus.ack(message).await
        } else {
            self.bus.nack(message).await
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    stream = %message.stream,
                    sequence = message.sequence,
                    ack = positive,
                    error = %e,
                    "Acknowledgment failed"
                );
                false
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map_or(false, |rx| *rx.borrow() || rx.has_changed().is_err())
    }

    /// Sleep for `delay`; true if shutdown arrived first.
    async fn sleep_or_shutdown(&mut self, delay: std::time::Duration) -> bool {
        match self.shutdown.as_mut() {
            Some(shutdown) => tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = wait_for_shutdown(shutdown) => true,
            },
            None => {
                tokio::time::sleep(delay).await;
                false
            }
        }
    }
}

/// Decode a delivery and check it arrived on the subject it claims.
fn decode_delivery(message: &RawMessage) -> Result<DomainEvent, GatewayError> {
    let event = codec::decode(&message.payload)?;
    if event.subject.as_str() != message.subject {
        return Err(GatewayError::MalformedPayload(format!(
            "envelope subject '{}' does not match delivery subject '{}'",
            event.subject, message.subject
        )));
    }
    Ok(event)
}

/// Resolves once the value is `true` or the sender is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use shared_bus::InMemoryBus;
    use shared_types::{
        EventPayload, ModelType, RoutingDecision, StreamDefinition, Subject,
    };

    use crate::dispatcher::{EventHandler, HandlerError, HandlerResult};

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: Mutex<u32>,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl EventHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, _event: &DomainEvent) -> HandlerResult {
            let mut calls = self.calls.lock();
            *calls += 1;
            if *calls <= self.failures {
                Err(HandlerError::new("model server returned 503"))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            group: "router".to_string(),
            fetch_timeout: Duration::from_millis(50),
            ..ConsumerConfig::default()
        }
    }

    fn routing_event(ticker: &str) -> DomainEvent {
        DomainEvent::new(
            Subject::new(format!("routing.{ticker}")).unwrap(),
            "router",
            EventPayload::RoutingDecision(RoutingDecision {
                ticker: ticker.to_string(),
                agent_type: ModelType::Normal,
                reason: "no earnings this week".to_string(),
            }),
        )
    }

    async fn bus_with_streams() -> Arc<InMemoryBus> {
        let bus = Arc::new(InMemoryBus::new());
        for def in [
            StreamDefinition::builder("ROUTING")
                .subject("routing.*")
                .build()
                .unwrap(),
            StreamDefinition::builder("DEAD_LETTER")
                .subject("dlq.>")
                .build()
                .unwrap(),
        ] {
            bus.declare_stream(&def).await.unwrap();
        }
        bus
    }

    async fn publish(bus: &InMemoryBus, event: &DomainEvent) {
        bus.publish(&event.subject, codec::encode(event).unwrap(), None)
            .await
            .unwrap();
    }

    fn consumer(
        bus: &Arc<InMemoryBus>,
        dispatcher: Dispatcher,
        config: ConsumerConfig,
    ) -> DurableConsumer<InMemoryBus> {
        DurableConsumer::new(
            bus.clone(),
            SubjectPattern::new("routing.*").unwrap(),
            Arc::new(dispatcher),
            DeadLetterSink::new(bus.clone(), "dlq"),
            config,
        )
    }

    fn routed(handler: Arc<dyn EventHandler>) -> Dispatcher {
        Dispatcher::new()
            .route(SubjectPattern::new("routing.*").unwrap(), handler)
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let bus = bus_with_streams().await;
        publish(&bus, &routing_event("AAPL")).await;
        let handler = Flaky::new(0);
        let mut consumer = consumer(&bus, routed(handler.clone()), config());
        assert_eq!(consumer.state(), ConsumerState::Disconnected);

        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.acked, 1);
        assert_eq!(consumer.state(), ConsumerState::Fetching);
        assert_eq!(bus.pending_count("ROUTING", "router"), 0);

        assert!(consumer.poll_once().await.unwrap().is_idle());
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_redelivered_then_acked() {
        let bus = bus_with_streams().await;
        publish(&bus, &routing_event("AAPL")).await;
        let handler = Flaky::new(1);
        let mut consumer = consumer(&bus, routed(handler.clone()), config());

        let first = consumer.poll_once().await.unwrap();
        assert_eq!(first.redelivery_requested, 1);
        let second = consumer.poll_once().await.unwrap();
        assert_eq!(second.acked, 1);
        assert_eq!(handler.calls(), 2);
        assert!(bus.messages("DEAD_LETTER").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dead_lettered_after_max_deliveries() {
        let bus = bus_with_streams().await;
        publish(&bus, &routing_event("AAPL")).await;
        let handler = Flaky::new(u32::MAX);
        let mut consumer = consumer(&bus, routed(handler.clone()), config());

        for _ in 0..2 {
            assert_eq!(consumer.poll_once().await.unwrap().redelivery_requested, 1);
        }
        let last = consumer.poll_once().await.unwrap();
        assert_eq!(last.dead_lettered, 1);
        assert_eq!(handler.calls(), 3);

        let dlq = bus.messages("DEAD_LETTER").unwrap();
        assert_eq!(dlq.len(), 1);
        let entry = DeadLetterEntry::from_bytes(&dlq[0].payload).unwrap();
        assert_eq!(entry.reason, DeadLetterReason::HandlerFailed);
        assert_eq!(entry.deliveries, 3);
        assert_eq!(bus.pending_count("ROUTING", "router"), 0);
        assert!(consumer.poll_once().await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_undecodable_goes_straight_to_dead_letter() {
        let bus = bus_with_streams().await;
        bus.publish(
            &Subject::new("routing.AAPL").unwrap(),
            Bytes::from_static(b"not json"),
            None,
        )
        .await
        .unwrap();
        let handler = Flaky::new(0);
        let mut consumer = consumer(&bus, routed(handler.clone()), config());

        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(handler.calls(), 0);

        let entry =
            DeadLetterEntry::from_bytes(&bus.messages("DEAD_LETTER").unwrap()[0].payload).unwrap();
        assert_eq!(entry.reason, DeadLetterReason::Undecodable);
        assert_eq!(entry.original_payload().unwrap(), b"not json");
    }

    #[tokio::test]
    async fn test_subject_mismatch_is_undecodable() {
        let bus = bus_with_streams().await;
        let event = routing_event("MSFT");
        bus.publish(
            &Subject::new("routing.AAPL").unwrap(),
            codec::encode(&event).unwrap(),
            None,
        )
        .await
        .unwrap();
        let mut consumer = consumer(&bus, routed(Flaky::new(0)), config());
        assert_eq!(consumer.poll_once().await.unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_failure_keeps_original() {
        let bus = Arc::new(InMemoryBus::new());
        bus.declare_stream(
            &StreamDefinition::builder("ROUTING")
                .subject("routing.*")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
        bus.publish(
            &Subject::new("routing.AAPL").unwrap(),
            Bytes::from_static(b"{}"),
            None,
        )
        .await
        .unwrap();
        let mut consumer = consumer(&bus, routed(Flaky::new(0)), config());

        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(report.redelivery_requested, 1);
        assert_eq!(bus.pending_count("ROUTING", "router"), 1);
    }

    #[tokio::test]
    async fn test_oversized_undecodable_is_dead_lettered_once() {
        let bus = bus_with_streams().await;
        let size = 600 * 1024;
        bus.publish(
            &Subject::new("routing.AAPL").unwrap(),
            Bytes::from(vec![b'x'; size]),
            None,
        )
        .await
        .unwrap();
        let mut consumer = consumer(&bus, routed(Flaky::new(0)), config());

        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.redelivery_requested, 0);
        assert_eq!(bus.pending_count("ROUTING", "router"), 0);
        assert!(consumer.poll_once().await.unwrap().is_idle());

        let entry =
            DeadLetterEntry::from_bytes(&bus.messages("DEAD_LETTER").unwrap()[0].payload).unwrap();
        assert_eq!(entry.reason, DeadLetterReason::Undecodable);
        assert!(entry.payload_truncated);
        assert_eq!(entry.payload_size, size);
    }

    #[tokio::test]
    async fn test_unroutable_acknowledged_by_default() {
        let bus = bus_with_streams().await;
        publish(&bus, &routing_event("AAPL")).await;
        let mut consumer = consumer(&bus, Dispatcher::new(), config());

        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.acked, 1);
        assert!(bus.messages("DEAD_LETTER").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unroutable_dead_letter_policy() {
        let bus = bus_with_streams().await;
        publish(&bus, &routing_event("AAPL")).await;
        let config = ConsumerConfig {
            unroutable: UnroutablePolicy::DeadLetter,
            ..config()
        };
        let mut consumer = consumer(&bus, Dispatcher::new(), config);

        assert_eq!(consumer.poll_once().await.unwrap().dead_lettered, 1);
        let entry =
            DeadLetterEntry::from_bytes(&bus.messages("DEAD_LETTER").unwrap()[0].payload).unwrap();
        assert_eq!(entry.reason, DeadLetterReason::Unroutable);
    }

    #[tokio::test]
    async fn test_fetch_error_disconnects() {
        let bus = bus_with_streams().await;
        bus.set_online(false);
        let mut consumer = consumer(&bus, routed(Flaky::new(0)), config());

        let err = consumer.poll_once().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(consumer.state(), ConsumerState::Disconnected);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_batch_unsettled() {
        let bus = bus_with_streams().await;
        publish(&bus, &routing_event("AAPL")).await;
        let (tx, rx) = watch::channel(false);
        let handler = Flaky::new(0);
        let mut consumer = consumer(&bus, routed(handler.clone()), config()).with_shutdown(rx);

        tx.send(true).unwrap();
        let report = consumer.poll_once().await.unwrap();
        assert!(report.interrupted);
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn test_run_recovers_from_outage_and_stops_on_shutdown() {
        let bus = bus_with_streams().await;
        bus.set_online(false);
        let handler = Flaky::new(0);
        let config = ConsumerConfig {
            backoff: crate::backoff::BackoffConfig {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(20),
                multiplier: 2,
            },
            ..config()
        };
        let mut consumer = consumer(&bus, routed(handler.clone()), config);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { consumer.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.set_online(true);
        publish(&bus, &routing_event("AAPL")).await;

        for _ in 0..100 {
            if handler.calls() == 1 && bus.pending_count("ROUTING", "router") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();

        let totals = task.await.unwrap().unwrap();
        assert_eq!(totals.acked, 1);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_when_sender_dropped() {
        let bus = bus_with_streams().await;
        let mut consumer = consumer(&bus, routed(Flaky::new(0)), config());
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let totals = consumer.run(rx).await.unwrap();
        assert_eq!(totals, BatchReport::default());
        assert_eq!(consumer.state(), ConsumerState::Disconnected);
    }
}
