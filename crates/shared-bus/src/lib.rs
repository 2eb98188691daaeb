//! # Shared Bus - Durable Message Bus Boundary
//!
//! The seam between the gateway and the message bus. Everything above this
//! crate speaks [`StreamBus`]; everything below it is a concrete broker.
//!
//! ## Delivery Model
//!
//! ```text
//! ┌──────────────┐  publish(subject, bytes, key)  ┌──────────────┐
//! │  Publisher   │ ─────────────────────────────▶ │    Stream    │
//! └──────────────┘ ◀── ack {stream, sequence} ─── │  (durable)   │
//!                                                 └──────┬───────┘
//!                                     pull(pattern, group)│
//!                                                         ▼
//!                                                 ┌──────────────┐
//!                                                 │   Consumer   │
//!                                                 │    group     │
//!                                                 └──────────────┘
//!                                                  ack / nack
//! ```
//!
//! - **At-least-once:** a pulled message is redelivered until acknowledged.
//! - **Dedup window:** a repeated dedup key inside the stream's window
//!   resolves to the original sequence.
//!
//! ## Implementations
//!
//! - [`InMemoryBus`]: process-local, used by tests and local runs.
//! - [`NatsBus`]: NATS JetStream via `async-nats`.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

use std::time::Duration;

pub mod boundary;
pub mod dedup_cache;
pub mod error;
pub mod memory;
pub mod nats;

// Re-export main types
pub use boundary::{
    DeclareOutcome, PublishAck, RawMessage, StreamBus, StreamInfo, StreamStats,
};
pub use dedup_cache::DedupWindow;
pub use error::BusError;
pub use memory::{InMemoryBus, StoredMessage};
pub use nats::{NatsBus, NatsBusConfig};

/// How long a delivered message may stay unacknowledged before the bus
/// redelivers it.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Subject prefix under which dead-lettered messages are republished.
pub const DLQ_SUBJECT_PREFIX: &str = "dlq";
