//! # Delivery Guarantees
//!
//! - A consumer that dies before acking does not lose the message
//! - A failing message is dead-lettered after exactly `max_deliveries`
//! - A dead-letter entry carries the original bytes back out
//! - A message too large to copy into the dead-letter stream still leaves
//!   its source stream
//! - A bus outage is survived by the run loop

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use shared_bus::{InMemoryBus, StreamBus};
    use shared_types::{DomainEvent, Subject, SubjectPattern};
    use stream_gateway::{
        catalog, codec, DeadLetterEntry, DeadLetterReason, Dispatcher, EventHandler,
        HandlerResult, UnroutablePolicy,
    };
    use tokio::sync::{watch, Notify};

    use crate::integration::fixtures::{self, RecordingHandler};

    fn pattern(s: &str) -> SubjectPattern {
        SubjectPattern::new(s).unwrap()
    }

    /// Signals when it starts, then never finishes.
    struct Hangs {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl EventHandler for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }

        async fn handle(&self, _event: &DomainEvent) -> HandlerResult {
            self.started.notify_one();
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_crash_before_ack_redelivers() {
        let bus = Arc::new(InMemoryBus::with_ack_wait(Duration::from_millis(200)));
        let gateway = fixtures::gateway_with(bus.clone(), fixtures::fast_config()).await;
        let event = fixtures::routing("AAPL");
        gateway.publisher().publish(&event, None).await.unwrap();

        // First consumer takes the message and dies inside the handler.
        let started = Arc::new(Notify::new());
        let hanging = Dispatcher::new()
            .route(
                pattern("routing.*"),
                Arc::new(Hangs {
                    started: started.clone(),
                }),
            )
            .unwrap();
        let mut doomed = gateway
            .consumer(pattern("routing.*"), Arc::new(hanging))
            .unwrap();
        let task = tokio::spawn(async move { doomed.poll_once().await });
        started.notified().await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(bus.pending_count(catalog::ROUTING, "stream-gateway"), 1);

        // A restarted consumer in the same group gets it again after ack wait.
        let handler = RecordingHandler::new("router");
        let dispatcher = Dispatcher::new()
            .route(pattern("routing.*"), handler.clone())
            .unwrap();
        let mut restarted = gateway
            .consumer(pattern("routing.*"), Arc::new(dispatcher))
            .unwrap();

        let mut acked = 0;
        for _ in 0..10 {
            acked += restarted.poll_once().await.unwrap().acked;
            if acked > 0 {
                break;
            }
        }
        assert_eq!(acked, 1);
        assert_eq!(handler.seen(), vec![event]);
        assert_eq!(bus.pending_count(catalog::ROUTING, "stream-gateway"), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_after_exactly_max_deliveries() {
        let bus = Arc::new(InMemoryBus::new());
        let mut config = fixtures::fast_config();
        config.consumer.max_deliveries = 4;
        let gateway = fixtures::gateway_with(bus.clone(), config).await;

        let event = fixtures::explanation_request("TSLA");
        gateway.publisher().publish(&event, None).await.unwrap();

        let handler = RecordingHandler::failing("explainer", u32::MAX);
        let dispatcher = Dispatcher::new()
            .route(pattern("explanations.request.*"), handler.clone())
            .unwrap();
        let mut consumer = gateway
            .consumer(pattern("explanations.request.*"), Arc::new(dispatcher))
            .unwrap();

        for attempt in 1..=3 {
            let report = consumer.poll_once().await.unwrap();
            assert_eq!(report.redelivery_requested, 1, "attempt {attempt}");
            assert!(bus.messages(catalog::DEAD_LETTER).unwrap().is_empty());
        }
        let last = consumer.poll_once().await.unwrap();
        assert_eq!(last.dead_lettered, 1);
        assert_eq!(handler.calls(), 4);
        assert!(consumer.poll_once().await.unwrap().is_idle());

        let dlq = bus.messages(catalog::DEAD_LETTER).unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].subject, "dlq.explanations.request.TSLA");

        let entry = DeadLetterEntry::from_bytes(&dlq[0].payload).unwrap();
        assert_eq!(entry.reason, DeadLetterReason::HandlerFailed);
        assert_eq!(entry.deliveries, 4);
        assert_eq!(entry.stream, catalog::EXPLANATIONS);
        assert!(entry.error.contains("attempt 4 failed"));

        // The original event comes back out of the entry intact.
        let original = codec::decode(&entry.original_payload().unwrap()).unwrap();
        assert_eq!(original, event);
    }

    #[tokio::test]
    async fn test_oversized_message_settles_within_delivery_budget() {
        let bus = Arc::new(InMemoryBus::new());
        let gateway = fixtures::gateway_with(bus.clone(), fixtures::fast_config()).await;
        let size = 600 * 1024;
        bus.publish(
            &Subject::new("routing.AAPL").unwrap(),
            Bytes::from(vec![b'x'; size]),
            None,
        )
        .await
        .unwrap();

        let dispatcher = Dispatcher::new()
            .route(pattern("routing.*"), RecordingHandler::new("router"))
            .unwrap();
        let mut consumer = gateway
            .consumer(pattern("routing.*"), Arc::new(dispatcher))
            .unwrap();

        let max_deliveries = gateway.config().consumer.max_deliveries;
        let mut dead_lettered = 0;
        for _ in 0..max_deliveries {
            dead_lettered += consumer.poll_once().await.unwrap().dead_lettered;
        }
        assert_eq!(dead_lettered, 1);
        assert_eq!(bus.pending_count(catalog::ROUTING, "stream-gateway"), 0);

        let dlq = bus.messages(catalog::DEAD_LETTER).unwrap();
        assert_eq!(dlq.len(), 1);
        let entry: serde_json::Value = serde_json::from_slice(&dlq[0].payload).unwrap();
        assert_eq!(entry["reason"], "undecodable");
        assert_eq!(entry["payload_truncated"], true);
        assert_eq!(entry["payload_size"], size);
        assert_eq!(entry["payload_hex"], "");
    }

    #[tokio::test]
    async fn test_handler_recovering_before_limit_is_not_dead_lettered() {
        let bus = Arc::new(InMemoryBus::new());
        let gateway = fixtures::gateway_with(bus.clone(), fixtures::fast_config()).await;
        gateway
            .publisher()
            .publish(&fixtures::model_metric("lstm"), None)
            .await
            .unwrap();

        // Default limit is 3; succeed on the third delivery.
        let handler = RecordingHandler::failing("metrics", 2);
        let dispatcher = Dispatcher::new()
            .route(pattern("metrics.model.*"), handler.clone())
            .unwrap();
        let mut consumer = gateway
            .consumer(pattern("metrics.model.*"), Arc::new(dispatcher))
            .unwrap();

        let mut total = stream_gateway::BatchReport::default();
        for _ in 0..3 {
            let report = consumer.poll_once().await.unwrap();
            total.acked += report.acked;
            total.dead_lettered += report.dead_lettered;
        }
        assert_eq!(total.acked, 1);
        assert_eq!(total.dead_lettered, 0);
        assert_eq!(handler.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_unroutable_policy_dead_letters() {
        let bus = Arc::new(InMemoryBus::new());
        let mut config = fixtures::fast_config();
        config.consumer.unroutable = UnroutablePolicy::DeadLetter;
        let gateway = fixtures::gateway_with(bus.clone(), config).await;
        gateway
            .publisher()
            .publish(&fixtures::explanation_result("AAPL"), None)
            .await
            .unwrap();

        // Consumer reads all explanations but only handles requests.
        let dispatcher = Dispatcher::new()
            .route(pattern("explanations.request.*"), RecordingHandler::new("req"))
            .unwrap();
        let mut consumer = gateway
            .consumer(pattern("explanations.>"), Arc::new(dispatcher))
            .unwrap();
        assert_eq!(consumer.poll_once().await.unwrap().dead_lettered, 1);

        let entry =
            DeadLetterEntry::from_bytes(&bus.messages(catalog::DEAD_LETTER).unwrap()[0].payload)
                .unwrap();
        assert_eq!(entry.reason, DeadLetterReason::Unroutable);
    }

    #[tokio::test]
    async fn test_run_loop_survives_outage() {
        let bus = Arc::new(InMemoryBus::new());
        let mut config = fixtures::fast_config();
        config.consumer.backoff.initial = Duration::from_millis(10);
        config.consumer.backoff.max = Duration::from_millis(50);
        let gateway = fixtures::gateway_with(bus.clone(), config).await;

        let handler = RecordingHandler::new("router");
        let dispatcher = Dispatcher::new()
            .route(pattern("routing.*"), handler.clone())
            .unwrap();
        let mut consumer = gateway
            .consumer(pattern("routing.*"), Arc::new(dispatcher))
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

        bus.set_online(false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        bus.set_online(true);

        gateway
            .publisher()
            .publish(&fixtures::routing("AAPL"), None)
            .await
            .unwrap();
        for _ in 0..100 {
            if !handler.seen().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        let totals = task.await.unwrap().unwrap();
        assert_eq!(totals.acked, 1);
        assert_eq!(handler.seen().len(), 1);
    }
}
