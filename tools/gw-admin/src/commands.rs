//! Command implementations.
//!
//! Every command works against any [`StreamBus`] and returns the text to
//! print, so the CLI wiring stays in `main.rs`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use shared_bus::StreamBus;
use shared_types::{DomainEvent, EventKind, EventPayload, Subject, SubjectPattern};
use stream_gateway::{catalog, codec, BusConfig, DeadLetterEntry, Gateway};

use crate::format;

/// Declare the platform catalog.
pub async fn setup<B: StreamBus + ?Sized>(gateway: &Gateway<B>) -> Result<String> {
    let outcomes = gateway
        .declare_catalog()
        .await
        .context("failed to declare platform streams")?;
    let mut out = String::new();
    for (name, outcome) in outcomes {
        out.push_str(&format!("{name:<16} {outcome:?}\n"));
    }
    Ok(out)
}

pub async fn list<B: StreamBus + ?Sized>(bus: &B) -> Result<String> {
    let mut streams = bus.list_streams().await.context("failed to list streams")?;
    if streams.is_empty() {
        return Ok("No streams declared\n".to_string());
    }
    streams.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(format::stream_table(&streams))
}

pub async fn info<B: StreamBus + ?Sized>(bus: &B, name: &str) -> Result<String> {
    let info = bus
        .stream_info(name)
        .await
        .with_context(|| format!("failed to read stream '{name}'"))?;
    Ok(format::stream_details(&info))
}

/// Delete a stream; refuses unless `confirmed`.
pub async fn delete<B: StreamBus + ?Sized>(
    bus: &B,
    name: &str,
    confirmed: bool,
) -> Result<String> {
    if !confirmed {
        bail!("deleting '{name}' removes all of its messages; pass --yes to confirm");
    }
    bus.delete_stream(name)
        .await
        .with_context(|| format!("failed to delete stream '{name}'"))?;
    Ok(format!("Deleted stream {name}\n"))
}

/// Build an event for `subject` from its JSON payload body.
pub fn build_event(subject: &str, body: &str, producer: &str) -> Result<DomainEvent> {
    let subject = Subject::new(subject)?;
    let kind = EventKind::for_subject(&subject)
        .with_context(|| format!("'{subject}' does not map to any event type"))?;
    let value: serde_json::Value = serde_json::from_str(body).context("payload is not JSON")?;
    let payload = EventPayload::from_value(kind, value)
        .with_context(|| format!("payload does not match {kind}"))?;
    Ok(DomainEvent::new(subject, producer, payload))
}

/// Publish through the gateway; the catalog is declared first.
pub async fn publish<B: StreamBus + ?Sized>(
    gateway: &Gateway<B>,
    event: &DomainEvent,
    dedup_key: Option<&str>,
) -> Result<String> {
    gateway.declare_catalog().await?;
    let ack = gateway.publisher().publish(event, dedup_key).await?;
    let note = if ack.duplicate { " (duplicate)" } else { "" };
    Ok(format!(
        "Published {} to {} #{}{note}\n",
        event.event_id, ack.stream, ack.sequence
    ))
}

/// Pull-subscribe options.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub group: String,
    /// Stop after this many messages.
    pub max_messages: usize,
    /// Stop after a fetch idles this long.
    pub idle_timeout: Duration,
    /// Acknowledge what was shown.
    pub ack: bool,
}

/// Pull messages matching `pattern` and render each one.
pub async fn subscribe<B: StreamBus + ?Sized>(
    bus: &B,
    pattern: &str,
    options: &SubscribeOptions,
) -> Result<Vec<String>> {
    let filter = SubjectPattern::new(pattern)?;
    let mut rendered = Vec::new();

    while rendered.len() < options.max_messages {
        let want = options.max_messages - rendered.len();
        let batch = bus
            .pull(&filter, &options.group, want, options.idle_timeout)
            .await
            .context("fetch failed")?;
        if batch.is_empty() {
            break;
        }
        for message in batch {
            rendered.push(format!(
                "[{} #{}] {} (delivery {})\n{}",
                message.stream,
                message.sequence,
                message.subject,
                message.delivered,
                render_payload(&message.payload)
            ));
            if options.ack {
                bus.ack(&message).await.context("ack failed")?;
            }
        }
    }
    Ok(rendered)
}

fn render_payload(payload: &[u8]) -> String {
    if let Ok(event) = codec::decode(payload) {
        if let Ok(value) = event.payload.to_value() {
            return format!(
                "  {} {} from {}\n  {}",
                event.kind(),
                event.event_id,
                event.producer_id,
                value
            );
        }
    }
    if let Ok(entry) = DeadLetterEntry::from_bytes(payload) {
        return format!(
            "  dead letter: {} after {} deliveries: {}",
            entry.reason, entry.deliveries, entry.error
        );
    }
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(value) => format!("  {value}"),
        Err(_) => format!("  {}", String::from_utf8_lossy(payload)),
    }
}

/// Connectivity and catalog presence.
pub async fn check<B: StreamBus + ?Sized>(
    bus: &B,
    bus_config: &BusConfig,
    dlq_prefix: &str,
) -> Result<String> {
    let existing = bus
        .list_streams()
        .await
        .with_context(|| format!("bus at {} is not reachable", bus_config.url))?;

    let mut out = format!("Connected to {}\n", bus_config.url);
    let mut missing = 0;
    for definition in catalog::platform_streams(dlq_prefix)? {
        let present = existing.iter().any(|s| s.name == definition.name);
        if !present {
            missing += 1;
        }
        out.push_str(&format!(
            "{:<16} {}\n",
            definition.name,
            if present { "ok" } else { "missing" }
        ));
    }
    if missing > 0 {
        out.push_str(&format!("{missing} stream(s) missing; run `gw-admin streams setup`\n"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use shared_bus::InMemoryBus;
    use stream_gateway::GatewayConfig;

    fn gateway() -> (Arc<InMemoryBus>, Gateway<InMemoryBus>) {
        let bus = Arc::new(InMemoryBus::new());
        let gateway = Gateway::new(bus.clone(), GatewayConfig::default()).unwrap();
        (bus, gateway)
    }

    const ROUTING_BODY: &str =
        r#"{"ticker":"AAPL","agent_type":"earnings","reason":"earnings call tomorrow"}"#;

    #[test]
    fn test_build_event_from_subject() {
        let event = build_event("routing.AAPL", ROUTING_BODY, "gw-admin").unwrap();
        assert_eq!(event.kind(), EventKind::RoutingDecision);
        assert_eq!(event.producer_id, "gw-admin");
    }

    #[test]
    fn test_build_event_rejects_unknown_subject() {
        assert!(build_event("orders.created", "{}", "gw-admin").is_err());
        assert!(build_event("routing.AAPL", "not json", "gw-admin").is_err());
    }

    #[tokio::test]
    async fn test_setup_then_check_and_list() {
        let (bus, gateway) = gateway();
        let config = BusConfig::default();

        let before = check(bus.as_ref(), &config, "dlq").await.unwrap();
        assert!(before.contains("6 stream(s) missing"));

        let out = setup(&gateway).await.unwrap();
        assert_eq!(out.lines().count(), 6);

        let after = check(bus.as_ref(), &config, "dlq").await.unwrap();
        assert!(!after.contains("missing"));

        let table = list(bus.as_ref()).await.unwrap();
        assert!(table.contains("MARKET_DATA"));
        assert!(table.contains("dlq.>"));
    }

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let (bus, gateway) = gateway();
        let event = build_event("routing.AAPL", ROUTING_BODY, "gw-admin").unwrap();
        let out = publish(&gateway, &event, Some("once")).await.unwrap();
        assert!(out.contains("ROUTING #1"));
        let again = publish(&gateway, &event, Some("once")).await.unwrap();
        assert!(again.contains("(duplicate)"));

        let options = SubscribeOptions {
            group: "inspect".to_string(),
            max_messages: 10,
            idle_timeout: Duration::from_millis(20),
            ack: true,
        };
        let shown = subscribe(bus.as_ref(), "routing.*", &options).await.unwrap();
        assert_eq!(shown.len(), 1);
        assert!(shown[0].contains("routing_decision"));

        let again = subscribe(bus.as_ref(), "routing.*", &options).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_delete_requires_confirmation() {
        let (bus, gateway) = gateway();
        setup(&gateway).await.unwrap();
        assert!(delete(bus.as_ref(), "ROUTING", false).await.is_err());
        delete(bus.as_ref(), "ROUTING", true).await.unwrap();
        assert!(info(bus.as_ref(), "ROUTING").await.is_err());
    }
}
