//! # Gateway Configuration
//!
//! Unified configuration for the bus connection, publisher, consumers and
//! dead-letter routing.
//!
//! All timeouts and limits have sane defaults; any of them can be overridden
//! through `GW_*` environment variables (see [`GatewayConfig::from_lookup`]).

use std::time::Duration;

use shared_bus::NatsBusConfig;

use crate::backoff::BackoffConfig;

/// Complete gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Bus connection.
    pub bus: BusConfig,
    /// Publisher limits.
    pub publisher: PublisherConfig,
    /// Durable consumer behaviour.
    pub consumer: ConsumerConfig,
    /// Dead-letter routing.
    pub dead_letter: DeadLetterConfig,
}

impl GatewayConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup(key)` for each known `GW_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("GW_NATS_URL") {
            config.bus.url = url;
        }
        if let Some(name) = lookup("GW_CLIENT_NAME") {
            config.bus.client_name = name;
        }
        if let Some(ms) = parse::<u64>(&lookup, "GW_PUBLISH_TIMEOUT_MS")? {
            config.publisher.publish_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<usize>(&lookup, "GW_MAX_IN_FLIGHT")? {
            config.publisher.max_in_flight = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "GW_FETCH_TIMEOUT_MS")? {
            config.consumer.fetch_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<usize>(&lookup, "GW_BATCH_SIZE")? {
            config.consumer.batch_size = n;
        }
        if let Some(n) = parse::<u32>(&lookup, "GW_MAX_DELIVERIES")? {
            config.consumer.max_deliveries = n;
        }
        if let Some(group) = lookup("GW_CONSUMER_GROUP") {
            config.consumer.group = group;
        }
        if let Some(policy) = lookup("GW_UNROUTABLE") {
            config.consumer.unroutable = match policy.as_str() {
                "ack" | "acknowledge" => UnroutablePolicy::Acknowledge,
                "dead-letter" | "dead_letter" | "dlq" => UnroutablePolicy::DeadLetter,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "GW_UNROUTABLE".to_string(),
                        value: policy,
                    })
                }
            };
        }
        if let Some(prefix) = lookup("GW_DLQ_PREFIX") {
            config.dead_letter.subject_prefix = prefix;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |field: &str| Err(ConfigError::MustBePositive(field.to_string()));

        if self.bus.url.trim().is_empty() {
            return Err(ConfigError::MissingValue("bus.url".to_string()));
        }
        if self.publisher.publish_timeout.is_zero() {
            return zero("publisher.publish_timeout");
        }
        if self.publisher.max_in_flight == 0 {
            return zero("publisher.max_in_flight");
        }
        if self.consumer.fetch_timeout.is_zero() {
            return zero("consumer.fetch_timeout");
        }
        if self.consumer.batch_size == 0 {
            return zero("consumer.batch_size");
        }
        if self.consumer.max_deliveries == 0 {
            return zero("consumer.max_deliveries");
        }
        if self.consumer.group.trim().is_empty() || self.consumer.group.contains('.') {
            return Err(ConfigError::InvalidValue {
                key: "consumer.group".to_string(),
                value: self.consumer.group.clone(),
            });
        }
        if self.consumer.backoff.initial.is_zero() {
            return zero("consumer.backoff.initial");
        }
        if self.consumer.backoff.initial > self.consumer.backoff.max {
            return Err(ConfigError::InvalidBackoff {
                initial: self.consumer.backoff.initial,
                max: self.consumer.backoff.max,
            });
        }
        if self.dead_letter.subject_prefix.trim().is_empty() {
            return Err(ConfigError::MissingValue(
                "dead_letter.subject_prefix".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment value could not be parsed.
    InvalidValue { key: String, value: String },
    /// A numeric setting is zero.
    MustBePositive(String),
    /// A required string is empty.
    MissingValue(String),
    /// Backoff starts above its cap.
    InvalidBackoff { initial: Duration, max: Duration },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value '{value}' for {key}")
            }
            ConfigError::MustBePositive(field) => write!(f, "{field} must be greater than zero"),
            ConfigError::MissingValue(field) => write!(f, "{field} must not be empty"),
            ConfigError::InvalidBackoff { initial, max } => write!(
                f,
                "backoff initial delay {initial:?} exceeds maximum {max:?}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Bus connection configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// NATS server URL.
    pub url: String,
    /// Connection name reported to the server.
    pub client_name: String,
    pub connect_timeout: Duration,
    /// Redelivery delay for unacknowledged messages.
    pub ack_wait: Duration,
}

impl From<&BusConfig> for NatsBusConfig {
    fn from(config: &BusConfig) -> Self {
        NatsBusConfig {
            url: config.url.clone(),
            client_name: Some(config.client_name.clone()),
            connect_timeout: config.connect_timeout,
            ack_wait: config.ack_wait,
            ..NatsBusConfig::default()
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            client_name: "stream-gateway".to_string(),
            connect_timeout: Duration::from_secs(5),
            ack_wait: Duration::from_secs(30),
        }
    }
}

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Max wait for the durable-commit ack (and for an in-flight slot).
    pub publish_timeout: Duration,
    /// Max concurrent publishes awaiting an ack.
    pub max_in_flight: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            max_in_flight: 256,
        }
    }
}

/// What to do with a decoded event no handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnroutablePolicy {
    /// Log and acknowledge.
    #[default]
    Acknowledge,
    /// Move to the dead-letter stream, then acknowledge.
    DeadLetter,
}

/// Durable consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer group (durable name); must not contain '.'.
    pub group: String,
    /// Messages per fetch.
    pub batch_size: usize,
    /// Max wait for a fetch to return.
    pub fetch_timeout: Duration,
    /// Total delivery attempts before a failing message is dead-lettered.
    pub max_deliveries: u32,
    pub unroutable: UnroutablePolicy,
    /// Reconnect backoff after transient failures.
    pub backoff: BackoffConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: "stream-gateway".to_string(),
            batch_size: 10,
            fetch_timeout: Duration::from_secs(5),
            max_deliveries: 3,
            unroutable: UnroutablePolicy::Acknowledge,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Dead-letter routing configuration.
#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    /// Dead-lettered messages are published to `<prefix>.<original subject>`.
    pub subject_prefix: String,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            subject_prefix: shared_bus::DLQ_SUBJECT_PREFIX.to_string(),
        }
    }
}
