//! # Gateway Runtime Library
//!
//! Exposes the runtime's modules for testing. The process entry point is
//! `main.rs`.

pub mod handlers;
pub mod runtime;

pub use handlers::EventLogger;
pub use runtime::{group_name, GatewayRuntime};
