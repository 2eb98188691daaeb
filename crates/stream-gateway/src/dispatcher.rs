//! # Dispatcher
//!
//! Routes a decoded event to exactly one application handler.
//!
//! - Handlers are registered against subject patterns.
//! - The most specific matching pattern wins; equal specificity falls back to
//!   registration order.
//! - A handler error or panic is reported as `HandlerFailed` and never
//!   escapes the dispatcher.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use shared_types::{DomainEvent, Subject, SubjectPattern};
use thiserror::Error;
use tracing::{debug, error};

use crate::error::GatewayError;

/// Failure reported by an [`EventHandler`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Application code invoked for each delivered event.
///
/// Handlers must tolerate redelivery of an event they already processed;
/// `event.event_id` is stable across deliveries.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and dead-letter entries.
    fn name(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> HandlerResult;
}

struct Route {
    pattern: SubjectPattern,
    handler: Arc<dyn EventHandler>,
}

/// Pattern → handler routing table.
#[derive(Default)]
pub struct Dispatcher {
    routes: Vec<Route>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route events matching `pattern` to `handler`.
    ///
    /// # Errors
    ///
    /// `DuplicateRoute` if `pattern` is already registered.
    pub fn register(
        &mut self,
        pattern: SubjectPattern,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), GatewayError> {
        if self.routes.iter().any(|r| r.pattern == pattern) {
            return Err(GatewayError::DuplicateRoute(pattern.to_string()));
        }
        debug!(pattern = %pattern, handler = handler.name(), "Route registered");
        self.routes.push(Route { pattern, handler });
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn route(
        mut self,
        pattern: SubjectPattern,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, GatewayError> {
        self.register(pattern, handler)?;
        Ok(self)
    }

    /// Handler chosen for `subject`, if any.
    #[must_use]
    pub fn handler_for(&self, subject: &Subject) -> Option<&Arc<dyn EventHandler>> {
        let mut best: Option<&Route> = None;
        for route in self.routes.iter().filter(|r| r.pattern.matches(subject)) {
            // Strictly greater keeps the earliest registration on ties.
            if best.map_or(true, |b| route.pattern.specificity() > b.pattern.specificity()) {
                best = Some(route);
            }
        }
        best.map(|r| &r.handler)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Patterns in registration order.
    #[must_use]
    pub fn patterns(&self) -> Vec<&SubjectPattern> {
        self.routes.iter().map(|r| &r.pattern).collect()
    }

    /// Run the chosen handler for `event`; returns the handler's name.
    ///
    /// # Errors
    ///
    /// - `NoHandlerRegistered` when no pattern matches
    /// - `HandlerFailed` when the handler returns an error or panics
    pub async fn dispatch(&self, event: &DomainEvent) -> Result<String, GatewayError> {
        let handler = self
            .handler_for(&event.subject)
            .ok_or_else(|| GatewayError::NoHandlerRegistered(event.subject.to_string()))?;
        let name = handler.name().to_string();

        let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => Ok(name),
            Ok(Err(e)) => Err(GatewayError::HandlerFailed {
                handler: name,
                reason: e.0,
            }),
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(
                    handler = %name,
                    subject = %event.subject,
                    event_id = %event.event_id,
                    panic = %reason,
                    "Handler panicked"
                );
                Err(GatewayError::HandlerFailed {
                    handler: name,
                    reason: format!("panicked: {reason}"),
                })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
