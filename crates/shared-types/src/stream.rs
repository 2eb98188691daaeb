//! # Stream Definitions
//!
//! Declarative description of a durable stream: which subjects it captures
//! and how long / how much it retains.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::TypeError;
use crate::subject::{Subject, SubjectPattern};

/// Maximum replica count a stream may request.
pub const MAX_REPLICAS: u8 = 5;

/// Default per-message size limit (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Default dedup window.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// Where the bus keeps a stream's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    /// Survives broker restart.
    File,
    /// Lost on broker restart; tests and ephemeral streams only.
    Memory,
}

/// When the bus may discard messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep until age/bytes/messages limits are hit.
    Limits,
    /// Remove once acknowledged by a consumer.
    WorkQueue,
    /// Keep while any consumer is interested.
    Interest,
}

/// On-disk compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    S2,
}

/// A named, durable stream and its retention policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDefinition {
    pub name: String,
    pub subjects: Vec<SubjectPattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub storage: StorageClass,
    pub retention: RetentionPolicy,
    pub compression: Compression,
    #[serde(with = "duration_secs")]
    pub max_age: Duration,
    pub max_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<u64>,
    pub max_message_size: u32,
    pub replicas: u8,
    #[serde(with = "duration_secs")]
    pub duplicate_window: Duration,
}

impl StreamDefinition {
    /// Start a definition with file storage, limits retention and one replica.
    pub fn builder(name: impl Into<String>) -> StreamDefinitionBuilder {
        StreamDefinitionBuilder::new(name)
    }

    /// Structural checks independent of any other stream.
    pub fn validate(&self) -> Result<(), TypeError> {
        let invalid = |reason: &str| TypeError::InvalidDefinition {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(invalid("name must be non-empty [A-Z0-9_-]"));
        }
        if self.subjects.is_empty() {
            return Err(invalid("at least one subject pattern is required"));
        }
        for (i, a) in self.subjects.iter().enumerate() {
            if self.subjects[i + 1..].contains(a) {
                return Err(invalid(&format!("subject pattern '{a}' listed twice")));
            }
        }
        if self.replicas == 0 || self.replicas > MAX_REPLICAS {
            return Err(invalid(&format!("replicas must be 1..={MAX_REPLICAS}")));
        }
        if self.max_bytes == 0 {
            return Err(invalid("max_bytes must be greater than zero"));
        }
        if self.max_message_size == 0 {
            return Err(invalid("max_message_size must be greater than zero"));
        }
        if u64::from(self.max_message_size) > self.max_bytes {
            return Err(invalid("max_message_size must not exceed max_bytes"));
        }
        if self.max_age.is_zero() {
            return Err(invalid("max_age must be greater than zero"));
        }
        Ok(())
    }

    /// Does this stream capture `subject`?
    #[must_use]
    pub fn captures(&self, subject: &Subject) -> bool {
        self.subjects.iter().any(|p| p.matches(subject))
    }

    /// Subject patterns as plain strings.
    #[must_use]
    pub fn subject_strings(&self) -> Vec<String> {
        self.subjects.iter().map(|p| p.as_str().to_string()).collect()
    }
}

impl fmt::Display for StreamDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.subject_strings().join(", "))
    }
}

/// Fluent builder for [`StreamDefinition`].
#[derive(Debug, Clone)]
pub struct StreamDefinitionBuilder {
    definition: StreamDefinition,
    patterns: Vec<String>,
}

impl StreamDefinitionBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            definition: StreamDefinition {
                name: name.into(),
                subjects: Vec::new(),
                description: None,
                storage: StorageClass::File,
                retention: RetentionPolicy::Limits,
                compression: Compression::None,
                max_age: Duration::from_secs(24 * 60 * 60),
                max_bytes: 1024 * 1024 * 1024,
                max_messages: None,
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
                replicas: 1,
                duplicate_window: DEFAULT_DUPLICATE_WINDOW,
            },
            patterns: Vec::new(),
        }
    }

    #[must_use]
    pub fn subject(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn storage(mut self, storage: StorageClass) -> Self {
        self.definition.storage = storage;
        self
    }

    #[must_use]
    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.definition.retention = retention;
        self
    }

    #[must_use]
    pub fn compression(mut self, compression: Compression) -> Self {
        self.definition.compression = compression;
        self
    }

    #[must_use]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.definition.max_age = max_age;
        self
    }

    #[must_use]
    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.definition.max_bytes = max_bytes;
        self
    }

    #[must_use]
    pub fn max_messages(mut self, max_messages: u64) -> Self {
        self.definition.max_messages = Some(max_messages);
        self
    }

    #[must_use]
    pub fn max_message_size(mut self, max_message_size: u32) -> Self {
        self.definition.max_message_size = max_message_size;
        self
    }

    #[must_use]
    pub fn replicas(mut self, replicas: u8) -> Self {
        self.definition.replicas = replicas;
        self
    }

    #[must_use]
    pub fn duplicate_window(mut self, window: Duration) -> Self {
        self.definition.duplicate_window = window;
        self
    }

    /// Parse the subject patterns and validate the whole definition.
    pub fn build(mut self) -> Result<StreamDefinition, TypeError> {
        self.definition.subjects = self
            .patterns
            .into_iter()
            .map(SubjectPattern::new)
            .collect::<Result<_, _>>()?;
        self.definition.validate()?;
        Ok(self.definition)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
