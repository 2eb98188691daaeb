//! Cross-crate integration flows. No live NATS server is needed; every test
//! runs against `InMemoryBus`.

pub mod fixtures;

mod delivery;
mod flows;
