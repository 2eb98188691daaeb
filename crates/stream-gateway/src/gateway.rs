//! # Gateway
//!
//! Wires the registry, publisher, dead-letter sink and consumers around one
//! bus handle and one [`GatewayConfig`].

use std::sync::Arc;

use shared_bus::{DeclareOutcome, StreamBus};
use shared_types::SubjectPattern;
use tracing::info;

use crate::catalog;
use crate::config::GatewayConfig;
use crate::consumer::DurableConsumer;
use crate::dead_letter::DeadLetterSink;
use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::publisher::Publisher;
use crate::registry::StreamRegistry;

/// Entry point for applications.
pub struct Gateway<B: StreamBus + ?Sized> {
    bus: Arc<B>,
    config: GatewayConfig,
    registry: Arc<StreamRegistry<B>>,
    publisher: Arc<Publisher<B>>,
    dead_letter: DeadLetterSink<B>,
}

impl<B: StreamBus + ?Sized> Gateway<B> {
    /// # Errors
    ///
    /// `Config` if `config` does not validate.
    pub fn new(bus: Arc<B>, config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;
        let registry = Arc::new(StreamRegistry::new(bus.clone()));
        let publisher = Arc::new(Publisher::new(registry.clone(), &config.publisher));
        let dead_letter = DeadLetterSink::new(bus.clone(), config.dead_letter.subject_prefix.clone());
        Ok(Self {
            bus,
            config,
            registry,
            publisher,
            dead_letter,
        })
    }

    /// Declare every platform stream, dead-letter stream included.
    pub async fn declare_catalog(&self) -> Result<Vec<(String, DeclareOutcome)>, GatewayError> {
        let streams = catalog::platform_streams(&self.config.dead_letter.subject_prefix)?;
        let outcomes = self.registry.declare_all(streams).await?;
        info!(streams = outcomes.len(), "Platform streams declared");
        Ok(outcomes)
    }

    /// Consumer for `filter` in the configured group.
    ///
    /// # Errors
    ///
    /// `NoMatchingStream` / `AmbiguousSubject` if no single declared stream
    /// covers `filter`.
    pub fn consumer(
        &self,
        filter: SubjectPattern,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<DurableConsumer<B>, GatewayError> {
        let group = self.config.consumer.group.clone();
        self.consumer_in_group(filter, group, dispatcher)
    }

    /// Consumer for `filter` in an explicit `group`.
    pub fn consumer_in_group(
        &self,
        filter: SubjectPattern,
        group: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<DurableConsumer<B>, GatewayError> {
        self.registry.resolve_filter(&filter)?;
        let mut config = self.config.consumer.clone();
        config.group = group.into();
        Ok(DurableConsumer::new(
            self.bus.clone(),
            filter,
            dispatcher,
            self.dead_letter.clone(),
            config,
        ))
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<StreamRegistry<B>> {
        &self.registry
    }

    #[must_use]
    pub fn publisher(&self) -> &Arc<Publisher<B>> {
        &self.publisher
    }

    #[must_use]
    pub fn dead_letter(&self) -> &DeadLetterSink<B> {
        &self.dead_letter
    }
}
