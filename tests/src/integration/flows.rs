//! # Publish → Stream → Consume Flows
//!
//! - Raw bus boundary: the `orders.*` scenario
//! - Every event kind survives publish and delivery unchanged
//! - Subject resolution is pure and picks the most specific stream
//! - Repeated publishes with one dedup key are stored and delivered once

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use shared_bus::{InMemoryBus, StreamBus};
    use shared_types::{StreamDefinition, Subject, SubjectPattern};
    use stream_gateway::{catalog, Dispatcher, GatewayError, StreamRegistry};

    use crate::integration::fixtures::{self, RecordingHandler};

    fn pattern(s: &str) -> SubjectPattern {
        SubjectPattern::new(s).unwrap()
    }

    // =========================================================================
    // BUS BOUNDARY
    // =========================================================================

    #[tokio::test]
    async fn test_orders_stream_publish_pull_ack() {
        let bus = InMemoryBus::new();
        bus.declare_stream(
            &StreamDefinition::builder("ORDERS")
                .subject("orders.*")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

        let ack = bus
            .publish(
                &Subject::new("orders.created").unwrap(),
                Bytes::from_static(br#"{"id":1}"#),
                None,
            )
            .await
            .unwrap();
        assert_eq!(ack.stream, "ORDERS");
        assert_eq!(ack.sequence, 1);

        let batch = bus
            .pull(&pattern("orders.*"), "g", 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject, "orders.created");
        assert_eq!(&batch[0].payload[..], br#"{"id":1}"#);
        bus.ack(&batch[0]).await.unwrap();

        let again = bus
            .pull(&pattern("orders.*"), "g", 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    // =========================================================================
    // GATEWAY FLOWS
    // =========================================================================

    #[tokio::test]
    async fn test_routing_event_published_and_consumed_once() {
        let bus = Arc::new(InMemoryBus::new());
        let gateway = fixtures::gateway_with(bus.clone(), fixtures::fast_config()).await;
        let handler = RecordingHandler::new("router");
        let dispatcher = Dispatcher::new()
            .route(pattern("routing.*"), handler.clone())
            .unwrap();
        let mut consumer = gateway
            .consumer(pattern("routing.*"), Arc::new(dispatcher))
            .unwrap();

        let event = fixtures::routing("AAPL");
        let ack = gateway.publisher().publish(&event, None).await.unwrap();
        assert_eq!(ack.stream, catalog::ROUTING);

        let report = consumer.poll_once().await.unwrap();
        assert_eq!((report.fetched, report.acked), (1, 1));
        assert!(consumer.poll_once().await.unwrap().is_idle());
        assert_eq!(handler.seen(), vec![event]);
    }

    #[tokio::test]
    async fn test_every_event_kind_delivered_unchanged() {
        let bus = Arc::new(InMemoryBus::new());
        let gateway = fixtures::gateway_with(bus.clone(), fixtures::fast_config()).await;

        let handler = RecordingHandler::new("everything");
        let mut dispatcher = Dispatcher::new();
        let definitions = gateway.registry().definitions();
        let filters: Vec<SubjectPattern> = definitions
            .iter()
            .filter(|d| d.name != catalog::DEAD_LETTER)
            .flat_map(|d| d.subjects.clone())
            .collect();
        for filter in &filters {
            dispatcher.register(filter.clone(), handler.clone()).unwrap();
        }
        let dispatcher = Arc::new(dispatcher);

        let events = fixtures::one_of_each();
        for event in &events {
            gateway.publisher().publish_with_event_id(event).await.unwrap();
        }

        for (index, filter) in filters.iter().enumerate() {
            let mut consumer = gateway
                .consumer_in_group(filter.clone(), format!("all-{index}"), dispatcher.clone())
                .unwrap();
            while !consumer.poll_once().await.unwrap().is_idle() {}
        }

        let mut seen = handler.seen();
        let mut expected = events.clone();
        seen.sort_by_key(|e| e.event_id);
        expected.sort_by_key(|e| e.event_id);
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_wildcard_consumer_sees_every_ticker() {
        let bus = Arc::new(InMemoryBus::new());
        let gateway = fixtures::gateway_with(bus.clone(), fixtures::fast_config()).await;
        for ticker in ["AAPL", "MSFT", "NVDA"] {
            gateway
                .publisher()
                .publish(&fixtures::market_tick(ticker), None)
                .await
                .unwrap();
        }

        let handler = RecordingHandler::new("ticks");
        let dispatcher = Dispatcher::new()
            .route(pattern("market.data.*"), handler.clone())
            .unwrap();
        let mut consumer = gateway
            .consumer(pattern("market.data.*"), Arc::new(dispatcher))
            .unwrap();
        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.acked, 3);

        let tickers: Vec<String> = handler
            .seen()
            .iter()
            .map(|e| e.subject.token(2).unwrap().to_string())
            .collect();
        assert_eq!(tickers, vec!["AAPL", "MSFT", "NVDA"]);
    }

    // =========================================================================
    // RESOLUTION
    // =========================================================================

    #[tokio::test]
    async fn test_resolve_is_pure() {
        let bus = Arc::new(InMemoryBus::new());
        let gateway = fixtures::gateway_with(bus.clone(), fixtures::fast_config()).await;
        let subject = Subject::new("predictions.earnings.NVDA").unwrap();

        let published_before = bus.messages_published();
        let first = gateway.registry().resolve(&subject).unwrap();
        for _ in 0..10 {
            assert_eq!(gateway.registry().resolve(&subject).unwrap(), first);
        }
        assert_eq!(first.name, catalog::PREDICTIONS);
        assert_eq!(bus.messages_published(), published_before);
    }

    #[tokio::test]
    async fn test_most_specific_stream_captures_subject() {
        let bus = Arc::new(InMemoryBus::new());
        let registry = StreamRegistry::new(bus.clone());
        registry
            .declare(
                StreamDefinition::builder("PREDICTIONS_ARCHIVE")
                    .subject("predictions.>")
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        registry
            .declare(
                StreamDefinition::builder("EARNINGS")
                    .subject("predictions.earnings.*")
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        let earnings = Subject::new("predictions.earnings.NVDA").unwrap();
        let normal = Subject::new("predictions.normal.NVDA").unwrap();
        assert_eq!(registry.resolve(&earnings).unwrap().name, "EARNINGS");
        assert_eq!(registry.resolve(&normal).unwrap().name, "PREDICTIONS_ARCHIVE");

        let ack = bus
            .publish(&earnings, Bytes::from_static(b"{}"), None)
            .await
            .unwrap();
        assert_eq!(ack.stream, "EARNINGS");
    }

    #[tokio::test]
    async fn test_unrouted_subject_is_rejected() {
        let bus = Arc::new(InMemoryBus::new());
        let registry = StreamRegistry::new(bus);
        assert!(matches!(
            registry.resolve(&Subject::new("orders.created").unwrap()),
            Err(GatewayError::NoMatchingStream(_))
        ));
    }

    // =========================================================================
    // DEDUPLICATION
    // =========================================================================

    #[tokio::test]
    async fn test_dedup_publish_is_idempotent() {
        let bus = Arc::new(InMemoryBus::new());
        let gateway = fixtures::gateway_with(bus.clone(), fixtures::fast_config()).await;
        let event = fixtures::prediction("AAPL", shared_types::ModelType::Normal);

        let mut sequences = Vec::new();
        for _ in 0..3 {
            let ack = gateway.publisher().publish_with_event_id(&event).await.unwrap();
            sequences.push(ack.sequence);
        }
        assert_eq!(sequences, vec![1, 1, 1]);
        assert_eq!(bus.messages(catalog::PREDICTIONS).unwrap().len(), 1);
        assert_eq!(gateway.publisher().stats().duplicates, 2);

        let handler = RecordingHandler::new("predictions");
        let dispatcher = Dispatcher::new()
            .route(pattern("predictions.normal.*"), handler.clone())
            .unwrap();
        let mut consumer = gateway
            .consumer(pattern("predictions.normal.*"), Arc::new(dispatcher))
            .unwrap();
        consumer.poll_once().await.unwrap();
        assert!(consumer.poll_once().await.unwrap().is_idle());
        assert_eq!(handler.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_events_without_key_are_both_stored() {
        let bus = Arc::new(InMemoryBus::new());
        let gateway = fixtures::gateway_with(bus.clone(), fixtures::fast_config()).await;
        let first = gateway
            .publisher()
            .publish(&fixtures::routing("AAPL"), None)
            .await
            .unwrap();
        let second = gateway
            .publisher()
            .publish(&fixtures::routing("AAPL"), None)
            .await
            .unwrap();
        assert_eq!((first.sequence, second.sequence), (1, 2));
    }
}
