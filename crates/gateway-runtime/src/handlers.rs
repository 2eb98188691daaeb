//! # Stream Handlers
//!
//! Default handlers installed by the runtime. They log each event with its
//! key fields and keep a count; downstream services replace them with their
//! own [`EventHandler`] implementations.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use shared_types::{DomainEvent, EventPayload};
use stream_gateway::{EventHandler, HandlerResult};
use tracing::info;

/// Logs every event it receives.
pub struct EventLogger {
    name: String,
    handled: AtomicU64,
}

impl EventLogger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handled: AtomicU64::new(0),
        }
    }

    /// Events handled so far.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventHandler for EventLogger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DomainEvent) -> HandlerResult {
        let id = event.event_id;
        let subject = &event.subject;
        match &event.payload {
            EventPayload::MarketTick(tick) => info!(
                %subject, %id, ticker = %tick.ticker, close = tick.close, volume = tick.volume,
                "Market tick"
            ),
            EventPayload::Prediction(p) => info!(
                %subject, %id, ticker = %p.ticker, model = %p.model_type,
                predicted = p.predicted_price, confidence = p.confidence,
                "Prediction"
            ),
            EventPayload::ModelMetric(m) => info!(
                %subject, %id, model = %m.model_name, version = %m.model_version,
                accuracy = ?m.accuracy,
                "Model metric"
            ),
            EventPayload::ExplanationRequest(r) => info!(
                %subject, %id, request = %r.request_id, ticker = %r.ticker,
                "Explanation requested"
            ),
            EventPayload::ExplanationResult(r) => info!(
                %subject, %id, request = %r.request_id, ticker = %r.ticker, model = %r.model,
                "Explanation ready"
            ),
            EventPayload::RoutingDecision(d) => info!(
                %subject, %id, ticker = %d.ticker, agent = %d.agent_type, reason = %d.reason,
                "Routing decision"
            ),
        }
        self.handled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
