//! # Stream Gateway
//!
//! Durable, at-least-once event transport for the prediction platform on top
//! of a subject-based streaming bus.
//!
//! ## Purpose
//!
//! Producers publish typed domain events; each event is routed by subject to
//! exactly one durable stream and committed before the publish returns.
//! Consumers pull in named groups, hand each event to one handler and
//! acknowledge only after the handler succeeds.
//!
//! ## Components
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | Codec | `codec` | `DomainEvent` ⇄ JSON envelope, schema checks |
//! | Stream Registry | `registry` | Declare streams, resolve subject → stream |
//! | Publisher | `publisher` | Validate, route, wait for durable commit |
//! | Durable Consumer | `consumer` | Pull loop, ack/nack, reconnect backoff |
//! | Dispatcher | `dispatcher` | Pattern → handler routing |
//! | Dead letter | `dead_letter` | Park messages that cannot succeed |
//!
//! ## Delivery Flow
//!
//! ```text
//! DomainEvent ─encode─→ Publisher ─resolve─→ Stream ─commit─→ PublishAck
//!                                               │
//!                          pull(filter, group)  ▼
//!                        DurableConsumer ─decode─→ Dispatcher ─→ EventHandler
//!                               │                                   │
//!                               ├── ok ───────────────────────────→ ack
//!                               ├── failed, deliveries < max ─────→ nack
//!                               └── failed, deliveries = max ─────→ dead letter, ack
//! ```
//!
//! ## Error Classes
//!
//! Every [`GatewayError`] maps to an [`ErrorClass`]: configuration errors are
//! fatal at startup, validation errors are fatal for one event, transient
//! errors are retryable, and handler errors are isolated to their message.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod backoff;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod publisher;
pub mod registry;

pub use backoff::{Backoff, BackoffConfig};
pub use config::{
    BusConfig, ConfigError, ConsumerConfig, DeadLetterConfig, GatewayConfig, PublisherConfig,
    UnroutablePolicy,
};
pub use consumer::{BatchReport, ConsumerState, DurableConsumer};
pub use dead_letter::{DeadLetterEntry, DeadLetterReason, DeadLetterSink};
pub use dispatcher::{Dispatcher, EventHandler, HandlerError, HandlerResult};
pub use error::{ErrorClass, GatewayError};
pub use gateway::Gateway;
pub use publisher::{Publisher, PublisherStats};
pub use registry::StreamRegistry;

// The bus boundary and data model, so applications need only this crate.
pub use shared_bus::{
    DeclareOutcome, InMemoryBus, NatsBus, NatsBusConfig, PublishAck, RawMessage, StreamBus,
    StreamInfo, StreamStats,
};
pub use shared_types::{
    DomainEvent, EventKind, EventPayload, StreamDefinition, Subject, SubjectPattern,
};
