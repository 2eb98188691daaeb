//! # Stream Registry
//!
//! Declares durable streams on the bus and resolves subjects to streams.
//!
//! ## Rules
//!
//! - Declaring an identical definition twice is a no-op.
//! - A definition that differs from an existing one with the same name fails
//!   with `StreamConflict`; the existing stream is never modified.
//! - A pattern that overlaps another stream's pattern at equal specificity is
//!   rejected at declaration, so `resolve` never meets an ambiguous subject
//!   at runtime.
//! - `resolve` is a pure function of the declarations: same inputs, same
//!   stream.

use std::sync::Arc;

use parking_lot::RwLock;
use shared_bus::{DeclareOutcome, StreamBus};
use shared_types::{Specificity, StreamDefinition, Subject, SubjectPattern};
use tracing::{debug, info};

use crate::error::GatewayError;

/// Local view of declared streams, kept in declaration order.
pub struct StreamRegistry<B: StreamBus + ?Sized> {
    bus: Arc<B>,
    definitions: RwLock<Vec<StreamDefinition>>,
}

impl<B: StreamBus + ?Sized> StreamRegistry<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self {
            bus,
            definitions: RwLock::new(Vec::new()),
        }
    }

    /// Validate `definition`, create it on the bus if missing, and record it.
    pub async fn declare(
        &self,
        definition: StreamDefinition,
    ) -> Result<DeclareOutcome, GatewayError> {
        definition.validate()?;
        self.check_against_declared(&definition)?;

        let outcome = self.bus.declare_stream(&definition).await?;

        let mut definitions = self.definitions.write();
        if !definitions.iter().any(|d| d.name == definition.name) {
            // Re-check: another task may have declared meanwhile.
            check_overlap(&definitions, &definition)?;
            info!(stream = %definition, ?outcome, "Stream registered");
            definitions.push(definition);
        } else {
            debug!(stream = %definition.name, "Stream already registered");
        }
        Ok(outcome)
    }

    /// Declare several definitions in order, stopping at the first failure.
    pub async fn declare_all(
        &self,
        definitions: impl IntoIterator<Item = StreamDefinition>,
    ) -> Result<Vec<(String, DeclareOutcome)>, GatewayError> {
        let mut outcomes = Vec::new();
        for definition in definitions {
            let name = definition.name.clone();
            let outcome = self.declare(definition).await?;
            outcomes.push((name, outcome));
        }
        Ok(outcomes)
    }

    /// The stream that captures `subject`.
    ///
    /// # Errors
    ///
    /// - `NoMatchingStream` when no declared pattern matches
    /// - `AmbiguousSubject` when two streams match at equal top specificity
    pub fn resolve(&self, subject: &Subject) -> Result<StreamDefinition, GatewayError> {
        let definitions = self.definitions.read();
        pick(
            definitions.iter().filter_map(|d| {
                d.subjects
                    .iter()
                    .filter(|p| p.matches(subject))
                    .map(SubjectPattern::specificity)
                    .max()
                    .map(|s| (s, d))
            }),
            subject.as_str(),
        )
    }

    /// The stream a consumer filter reads from: one whose pattern covers
    /// every subject the filter can match.
    pub fn resolve_filter(
        &self,
        filter: &SubjectPattern,
    ) -> Result<StreamDefinition, GatewayError> {
        let definitions = self.definitions.read();
        pick(
            definitions.iter().filter_map(|d| {
                d.subjects
                    .iter()
                    .filter(|p| p.covers(filter))
                    .map(SubjectPattern::specificity)
                    .max()
                    .map(|s| (s, d))
            }),
            filter.as_str(),
        )
    }

    /// Declared definitions in declaration order.
    #[must_use]
    pub fn definitions(&self) -> Vec<StreamDefinition> {
        self.definitions.read().clone()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<StreamDefinition> {
        self.definitions
            .read()
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.read().is_empty()
    }

    /// The bus this registry declares on.
    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    fn check_against_declared(&self, definition: &StreamDefinition) -> Result<(), GatewayError> {
        let definitions = self.definitions.read();
        if let Some(existing) = definitions.iter().find(|d| d.name == definition.name) {
            if existing != definition {
                return Err(GatewayError::StreamConflict {
                    name: definition.name.clone(),
                    reason: "a different definition was already declared in this process"
                        .to_string(),
                });
            }
            return Ok(());
        }
        check_overlap(&definitions, definition)
    }
}

fn check_overlap(
    declared: &[StreamDefinition],
    definition: &StreamDefinition,
) -> Result<(), GatewayError> {
    for other in declared.iter().filter(|d| d.name != definition.name) {
        for pattern in &definition.subjects {
            let clash = other
                .subjects
                .iter()
                .any(|q| pattern.overlaps(q) && pattern.specificity() == q.specificity());
            if clash {
                return Err(GatewayError::AmbiguousSubject {
                    subject: pattern.to_string(),
                    streams: vec![other.name.clone(), definition.name.clone()],
                });
            }
        }
    }
    Ok(())
}

fn pick<'a>(
    candidates: impl Iterator<Item = (Specificity, &'a StreamDefinition)>,
    subject: &str,
) -> Result<StreamDefinition, GatewayError> {
    let mut best: Option<Specificity> = None;
    let mut winners: Vec<&StreamDefinition> = Vec::new();
    for (specificity, definition) in candidates {
        match best {
            Some(b) if specificity < b => {}
            Some(b) if specificity == b => winners.push(definition),
            _ => {
                best = Some(specificity);
                winners.clear();
                winners.push(definition);
            }
        }
    }

    match winners.as_slice() {
        [] => Err(GatewayError::NoMatchingStream(subject.to_string())),
        [only] => Ok((*only).clone()),
        many => Err(GatewayError::AmbiguousSubject {
            subject: subject.to_string(),
            streams: many.iter().map(|d| d.name.clone()).collect(),
        }),
    }
}
