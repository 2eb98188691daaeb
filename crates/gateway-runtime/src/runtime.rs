//! # Gateway Runtime
//!
//! ## Startup Sequence
//!
//! 1. Declare the platform stream catalog
//! 2. Build one dispatcher with a logging handler per stream
//! 3. Spawn one durable consumer per stream subject (dead-letter excluded)
//!
//! ## Shutdown Sequence
//!
//! 1. Flip the shutdown signal
//! 2. Wait for every consumer to finish its current message
//! 3. Report per-consumer totals

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use shared_bus::StreamBus;
use stream_gateway::{
    catalog, BatchReport, Dispatcher, EventHandler, Gateway, GatewayConfig, GatewayError,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::handlers::EventLogger;

type ConsumerTask = JoinHandle<Result<BatchReport, GatewayError>>;

/// Consumer group for `subject_index` of `stream`.
///
/// Durable names are per stream and bound to one filter, so a stream with
/// several subjects needs one group per subject.
pub fn group_name(base: &str, stream: &str, subject_index: usize, subjects: usize) -> String {
    let stream = stream.to_lowercase().replace('_', "-");
    if subjects > 1 {
        format!("{base}-{stream}-{subject_index}")
    } else {
        format!("{base}-{stream}")
    }
}

/// The running gateway process.
pub struct GatewayRuntime<B: StreamBus + ?Sized + 'static> {
    gateway: Arc<Gateway<B>>,
    loggers: HashMap<String, Arc<EventLogger>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<(String, ConsumerTask)>,
}

impl<B: StreamBus + ?Sized + 'static> GatewayRuntime<B> {
    pub fn new(bus: Arc<B>, config: GatewayConfig) -> Result<Self> {
        let gateway = Gateway::new(bus, config).context("invalid gateway configuration")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            gateway: Arc::new(gateway),
            loggers: HashMap::new(),
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway<B>> {
        &self.gateway
    }

    /// The logging handler for `stream`, once started.
    pub fn logger(&self, stream: &str) -> Option<&Arc<EventLogger>> {
        self.loggers.get(stream)
    }

    /// Number of running consumers.
    pub fn consumer_count(&self) -> usize {
        self.tasks.len()
    }

    /// Declare streams and spawn the consumers.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting stream gateway runtime");

        let outcomes = self
            .gateway
            .declare_catalog()
            .await
            .context("failed to declare platform streams")?;
        for (name, outcome) in &outcomes {
            info!(stream = %name, ?outcome, "Stream ready");
        }

        let streams: Vec<_> = self
            .gateway
            .registry()
            .definitions()
            .into_iter()
            .filter(|d| d.name != catalog::DEAD_LETTER)
            .collect();

        let mut dispatcher = Dispatcher::new();
        for stream in &streams {
            let logger = Arc::new(EventLogger::new(stream.name.to_lowercase()));
            for pattern in &stream.subjects {
                dispatcher.register(pattern.clone(), logger.clone() as Arc<dyn EventHandler>)?;
            }
            self.loggers.insert(stream.name.clone(), logger);
        }
        let dispatcher = Arc::new(dispatcher);

        let base = self.gateway.config().consumer.group.clone();
        for stream in &streams {
            for (index, pattern) in stream.subjects.iter().enumerate() {
                let group = group_name(&base, &stream.name, index, stream.subjects.len());
                let mut consumer = self.gateway.consumer_in_group(
                    pattern.clone(),
                    group.clone(),
                    dispatcher.clone(),
                )?;
                let shutdown = self.shutdown_rx.clone();
                info!(stream = %stream.name, filter = %pattern, group = %group, "Spawning consumer");
                let task = tokio::spawn(async move { consumer.run(shutdown).await });
                self.tasks.push((group, task));
            }
        }

        info!(consumers = self.tasks.len(), "Stream gateway runtime started");
        Ok(())
    }

    /// Signal every consumer to stop and wait up to `grace` for each.
    pub async fn shutdown(&mut self, grace: Duration) -> Vec<(String, BatchReport)> {
        info!("Initiating graceful shutdown...");
        if let Err(e) = self.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal: {}", e);
        }

        let mut totals = Vec::new();
        for (group, task) in self.tasks.drain(..) {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(Ok(report))) => totals.push((group, report)),
                Ok(Ok(Err(e))) => error!(group = %group, error = %e, "Consumer exited with error"),
                Ok(Err(e)) => error!(group = %group, error = %e, "Consumer task panicked"),
                Err(_) => warn!(group = %group, ?grace, "Consumer did not stop in time"),
            }
        }

        info!("Shutdown complete");
        totals
    }
}
