//! # Stream Gateway Test Suite
//!
//! Unified test crate containing:
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/          # Codec, subject matching and resolve throughput
//! └── src/integration/  # Cross-crate delivery flows against InMemoryBus
//!     ├── fixtures.rs   # Sample events and recording handlers
//!     ├── flows.rs      # Publish → stream → consume paths, routing, dedup
//!     └── delivery.rs   # At-least-once, redelivery, dead-lettering
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p gw-tests
//!
//! # By category
//! cargo test -p gw-tests integration::flows::
//! cargo test -p gw-tests integration::delivery::
//!
//! # Benchmarks
//! cargo bench -p gw-tests
//! ```

#![allow(dead_code)]

pub mod integration;
