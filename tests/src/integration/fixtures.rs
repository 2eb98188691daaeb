//! Sample events and recording handlers shared by the flows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use shared_bus::InMemoryBus;
use shared_types::{
    DomainEvent, EventPayload, ExplanationRequest, ExplanationResult, MarketTick, ModelMetric,
    ModelType, PredictionEvent, RoutingDecision, Subject,
};
use stream_gateway::{EventHandler, Gateway, GatewayConfig, HandlerError, HandlerResult};
use uuid::Uuid;

fn subject(s: &str) -> Subject {
    Subject::new(s).expect("fixture subject")
}

pub fn market_tick(ticker: &str) -> DomainEvent {
    DomainEvent::new(
        subject(&format!("market.data.{ticker}")),
        "market-feed",
        EventPayload::MarketTick(MarketTick {
            ticker: ticker.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 15, 14, 30, 0).unwrap(),
            open: 171.2,
            high: 173.95,
            low: 170.85,
            close: 173.5,
            volume: 48_211_340,
        }),
    )
}

pub fn prediction(ticker: &str, model: ModelType) -> DomainEvent {
    DomainEvent::new(
        subject(&format!("predictions.{}.{ticker}", model.as_str())),
        format!("{model}-agent"),
        EventPayload::Prediction(PredictionEvent {
            ticker: ticker.to_string(),
            prediction_time: Utc::now(),
            predicted_price: 176.42,
            current_price: 173.5,
            change_percent: 1.683,
            confidence: 0.82,
            model_type: model,
            model_version: "lstm-2.3.1".to_string(),
            features: None,
            metadata: None,
        }),
    )
}

pub fn model_metric(name: &str) -> DomainEvent {
    DomainEvent::new(
        subject(&format!("metrics.model.{name}")),
        "evaluator",
        EventPayload::ModelMetric(ModelMetric {
            model_name: name.to_string(),
            model_version: "2.3.1".to_string(),
            model_type: ModelType::Normal,
            accuracy: Some(0.91),
            precision: Some(0.88),
            recall: None,
            f1_score: None,
            evaluated_at: Utc::now(),
        }),
    )
}

pub fn explanation_request(ticker: &str) -> DomainEvent {
    DomainEvent::new(
        subject(&format!("explanations.request.{ticker}")),
        "dashboard",
        EventPayload::ExplanationRequest(ExplanationRequest {
            request_id: Uuid::new_v4(),
            ticker: ticker.to_string(),
            prediction_time: Utc::now(),
            question: Some("Why is the earnings model bullish?".to_string()),
        }),
    )
}

pub fn explanation_result(ticker: &str) -> DomainEvent {
    DomainEvent::new(
        subject(&format!("explanations.result.{ticker}")),
        "explainer",
        EventPayload::ExplanationResult(ExplanationResult {
            request_id: Uuid::new_v4(),
            ticker: ticker.to_string(),
            explanation: "Guidance was raised and implied volatility fell.".to_string(),
            model: "llama3".to_string(),
            generated_at: Utc::now(),
        }),
    )
}

pub fn routing(ticker: &str) -> DomainEvent {
    DomainEvent::new(
        subject(&format!("routing.{ticker}")),
        "router",
        EventPayload::RoutingDecision(RoutingDecision {
            ticker: ticker.to_string(),
            agent_type: ModelType::Earnings,
            reason: "earnings call within 3 days".to_string(),
        }),
    )
}

/// One event of every kind.
pub fn one_of_each() -> Vec<DomainEvent> {
    vec![
        market_tick("AAPL"),
        prediction("AAPL", ModelType::Normal),
        prediction("NVDA", ModelType::Earnings),
        model_metric("lstm"),
        explanation_request("AAPL"),
        explanation_result("AAPL"),
        routing("MSFT"),
    ]
}

/// Config tuned for fast tests.
pub fn fast_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.consumer.fetch_timeout = Duration::from_millis(100);
    config.publisher.publish_timeout = Duration::from_secs(1);
    config
}

/// Gateway over a fresh bus with the catalog declared.
pub async fn gateway_with(bus: Arc<InMemoryBus>, config: GatewayConfig) -> Gateway<InMemoryBus> {
    let gateway = Gateway::new(bus, config).expect("valid config");
    gateway.declare_catalog().await.expect("catalog declares");
    gateway
}

/// Records every event; fails the first `failures` calls.
pub struct RecordingHandler {
    name: String,
    failures: u32,
    calls: Mutex<u32>,
    seen: Mutex<Vec<DomainEvent>>,
}

impl RecordingHandler {
    pub fn new(name: &str) -> Arc<Self> {
        Self::failing(name, 0)
    }

    pub fn failing(name: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failures,
            calls: Mutex::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }

    /// Events handled successfully.
    pub fn seen(&self) -> Vec<DomainEvent> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DomainEvent) -> HandlerResult {
        let call = {
            let mut calls = self.calls.lock();
            *calls += 1;
            *calls
        };
        if call <= self.failures {
            return Err(HandlerError::new(format!("attempt {call} failed")));
        }
        self.seen.lock().push(event.clone());
        Ok(())
    }
}
