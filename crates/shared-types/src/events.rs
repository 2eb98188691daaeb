//! # Domain Event Payloads
//!
//! Typed payloads for every event the platform moves over the bus, plus the
//! field-level validation the codec enforces on encode and decode.
//!
//! ## Subject Map
//!
//! | Subject                        | Kind                 |
//! |--------------------------------|----------------------|
//! | `market.data.<ticker>`         | `MarketTick`         |
//! | `predictions.<model>.<ticker>` | `Prediction`         |
//! | `metrics.model.<name>`         | `ModelMetric`        |
//! | `explanations.request.<ticker>`| `ExplanationRequest` |
//! | `explanations.result.<ticker>` | `ExplanationResult`  |
//! | `routing.<ticker>`             | `RoutingDecision`    |

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subject::Subject;

/// Maximum ticker length (matches the `VARCHAR(10)` ticker columns downstream).
pub const MAX_TICKER_LEN: usize = 10;

/// Maximum model version length.
pub const MAX_MODEL_VERSION_LEN: usize = 20;

/// Maximum model name length.
pub const MAX_MODEL_NAME_LEN: usize = 50;

/// A single field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// Dotted path of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub reason: String,
}

impl FieldViolation {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Which prediction agent produced (or should produce) a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Normal,
    Earnings,
}

impl ModelType {
    /// Subject token for this model type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Normal => "normal",
            ModelType::Earnings => "earnings",
        }
    }

    /// Parse a subject token.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "normal" => Some(ModelType::Normal),
            "earnings" => Some(ModelType::Earnings),
            _ => None,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OHLCV bar for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    pub ticker: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// A price prediction emitted by one of the prediction agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionEvent {
    pub ticker: String,
    pub prediction_time: DateTime<Utc>,
    pub predicted_price: f64,
    pub current_price: f64,
    pub change_percent: f64,
    pub confidence: f64,
    pub model_type: ModelType,
    pub model_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

/// Evaluation scores for a deployed model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetric {
    pub model_name: String,
    pub model_version: String,
    pub model_type: ModelType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f1_score: Option<f64>,
    pub evaluated_at: DateTime<Utc>,
}

/// Ask the explanation service to explain a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationRequest {
    pub request_id: Uuid,
    pub ticker: String,
    pub prediction_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

/// A generated explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationResult {
    pub request_id: Uuid,
    pub ticker: String,
    pub explanation: String,
    pub model: String,
    pub generated_at: DateTime<Utc>,
}

/// Which agent a ticker was routed to, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub ticker: String,
    pub agent_type: ModelType,
    pub reason: String,
}

/// Discriminant of [`EventPayload`], derivable from a subject alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MarketTick,
    Prediction,
    ModelMetric,
    ExplanationRequest,
    ExplanationResult,
    RoutingDecision,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 6] = [
        EventKind::MarketTick,
        EventKind::Prediction,
        EventKind::ModelMetric,
        EventKind::ExplanationRequest,
        EventKind::ExplanationResult,
        EventKind::RoutingDecision,
    ];

    /// Wire tag written into the envelope's `type` field.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MarketTick => "market_tick",
            EventKind::Prediction => "prediction",
            EventKind::ModelMetric => "model_metric",
            EventKind::ExplanationRequest => "explanation_request",
            EventKind::ExplanationResult => "explanation_result",
            EventKind::RoutingDecision => "routing_decision",
        }
    }

    /// Map a subject to the event kind it carries.
    #[must_use]
    pub fn for_subject(subject: &Subject) -> Option<Self> {
        let tokens: Vec<&str> = subject.tokens().collect();
        match tokens.as_slice() {
            ["market", "data", _] => Some(EventKind::MarketTick),
            ["predictions", model, _] if ModelType::from_token(model).is_some() => {
                Some(EventKind::Prediction)
            }
            ["metrics", "model", _] => Some(EventKind::ModelMetric),
            ["explanations", "request", _] => Some(EventKind::ExplanationRequest),
            ["explanations", "result", _] => Some(EventKind::ExplanationResult),
            ["routing", _] => Some(EventKind::RoutingDecision),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The typed payload of a domain event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    MarketTick(MarketTick),
    Prediction(PredictionEvent),
    ModelMetric(ModelMetric),
    ExplanationRequest(ExplanationRequest),
    ExplanationResult(ExplanationResult),
    RoutingDecision(RoutingDecision),
}

impl EventPayload {
    /// Discriminant of this payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::MarketTick(_) => EventKind::MarketTick,
            EventPayload::Prediction(_) => EventKind::Prediction,
            EventPayload::ModelMetric(_) => EventKind::ModelMetric,
            EventPayload::ExplanationRequest(_) => EventKind::ExplanationRequest,
            EventPayload::ExplanationResult(_) => EventKind::ExplanationResult,
            EventPayload::RoutingDecision(_) => EventKind::RoutingDecision,
        }
    }

    /// Render the payload body as JSON (without the kind tag).
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            EventPayload::MarketTick(p) => serde_json::to_value(p),
            EventPayload::Prediction(p) => serde_json::to_value(p),
            EventPayload::ModelMetric(p) => serde_json::to_value(p),
            EventPayload::ExplanationRequest(p) => serde_json::to_value(p),
            EventPayload::ExplanationResult(p) => serde_json::to_value(p),
            EventPayload::RoutingDecision(p) => serde_json::to_value(p),
        }
    }

    /// Parse a payload body of the given kind.
    pub fn from_value(kind: EventKind, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EventKind::MarketTick => EventPayload::MarketTick(serde_json::from_value(value)?),
            EventKind::Prediction => EventPayload::Prediction(serde_json::from_value(value)?),
            EventKind::ModelMetric => EventPayload::ModelMetric(serde_json::from_value(value)?),
            EventKind::ExplanationRequest => {
                EventPayload::ExplanationRequest(serde_json::from_value(value)?)
            }
            EventKind::ExplanationResult => {
                EventPayload::ExplanationResult(serde_json::from_value(value)?)
            }
            EventKind::RoutingDecision => {
                EventPayload::RoutingDecision(serde_json::from_value(value)?)
            }
        })
    }

    /// Check every field rule for this payload.
    pub fn validate(&self) -> Result<(), FieldViolation> {
        match self {
            EventPayload::MarketTick(p) => p.validate(),
            EventPayload::Prediction(p) => p.validate(),
            EventPayload::ModelMetric(p) => p.validate(),
            EventPayload::ExplanationRequest(p) => validate_ticker("ticker", &p.ticker),
            EventPayload::ExplanationResult(p) => {
                validate_ticker("ticker", &p.ticker)?;
                non_empty("explanation", &p.explanation)?;
                non_empty("model", &p.model)
            }
            EventPayload::RoutingDecision(p) => {
                validate_ticker("ticker", &p.ticker)?;
                non_empty("reason", &p.reason)
            }
        }
    }

    /// Check that this payload may travel on `subject`.
    pub fn validate_subject(&self, subject: &Subject) -> Result<(), FieldViolation> {
        match EventKind::for_subject(subject) {
            Some(kind) if kind == self.kind() => {}
            Some(kind) => {
                return Err(FieldViolation::new(
                    "subject",
                    format!("'{subject}' carries {kind} events, not {}", self.kind()),
                ))
            }
            None => {
                return Err(FieldViolation::new(
                    "subject",
                    format!("'{subject}' does not map to any event type"),
                ))
            }
        }

        if let EventPayload::Prediction(p) = self {
            if subject.token(1) != Some(p.model_type.as_str()) {
                return Err(FieldViolation::new(
                    "model_type",
                    format!("'{}' does not match subject '{subject}'", p.model_type),
                ));
            }
        }
        Ok(())
    }
}

impl MarketTick {
    fn validate(&self) -> Result<(), FieldViolation> {
        validate_ticker("ticker", &self.ticker)?;
        positive_price("open", self.open)?;
        positive_price("high", self.high)?;
        positive_price("low", self.low)?;
        positive_price("close", self.close)?;
        if self.low > self.high {
            return Err(FieldViolation::new("low", "must not exceed high"));
        }
        for (field, value) in [("open", self.open), ("close", self.close)] {
            if value < self.low || value > self.high {
                return Err(FieldViolation::new(field, "must lie within [low, high]"));
            }
        }
        Ok(())
    }
}

impl PredictionEvent {
    fn validate(&self) -> Result<(), FieldViolation> {
        validate_ticker("ticker", &self.ticker)?;
        positive_price("predicted_price", self.predicted_price)?;
        positive_price("current_price", self.current_price)?;
        finite("change_percent", self.change_percent)?;
        unit_interval("confidence", self.confidence)?;
        bounded_text("model_version", &self.model_version, MAX_MODEL_VERSION_LEN)
    }
}

impl ModelMetric {
    fn validate(&self) -> Result<(), FieldViolation> {
        bounded_text("model_name", &self.model_name, MAX_MODEL_NAME_LEN)?;
        bounded_text("model_version", &self.model_version, MAX_MODEL_VERSION_LEN)?;
        for (field, score) in [
            ("accuracy", self.accuracy),
            ("precision", self.precision),
            ("recall", self.recall),
            ("f1_score", self.f1_score),
        ] {
            if let Some(score) = score {
                unit_interval(field, score)?;
            }
        }
        Ok(())
    }
}

fn validate_ticker(field: &str, ticker: &str) -> Result<(), FieldViolation> {
    bounded_text(field, ticker, MAX_TICKER_LEN)?;
    if !ticker
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(FieldViolation::new(
            field,
            format!("'{ticker}' must be uppercase alphanumeric"),
        ));
    }
    Ok(())
}

fn non_empty(field: &str, value: &str) -> Result<(), FieldViolation> {
    if value.trim().is_empty() {
        return Err(FieldViolation::new(field, "must not be empty"));
    }
    Ok(())
}

fn bounded_text(field: &str, value: &str, max: usize) -> Result<(), FieldViolation> {
    non_empty(field, value)?;
    if value.chars().count() > max {
        return Err(FieldViolation::new(
            field,
            format!("must be at most {max} characters"),
        ));
    }
    Ok(())
}

fn finite(field: &str, value: f64) -> Result<(), FieldViolation> {
    if !value.is_finite() {
        return Err(FieldViolation::new(field, "must be a finite number"));
    }
    Ok(())
}

fn positive_price(field: &str, value: f64) -> Result<(), FieldViolation> {
    finite(field, value)?;
    if value <= 0.0 {
        return Err(FieldViolation::new(field, "must be greater than zero"));
    }
    Ok(())
}

fn unit_interval(field: &str, value: f64) -> Result<(), FieldViolation> {
    finite(field, value)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(FieldViolation::new(field, "must be between 0 and 1"));
    }
    Ok(())
}
