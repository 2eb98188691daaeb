//! # Platform Stream Catalog
//!
//! The durable streams the prediction platform runs on.
//!
//! | Stream        | Subjects                                         | Age  | Bytes   |
//! |---------------|--------------------------------------------------|------|---------|
//! | MARKET_DATA   | `market.data.*`                                  | 7 d  | 10 GiB  |
//! | PREDICTIONS   | `predictions.normal.*`, `predictions.earnings.*` | 30 d | 5 GiB   |
//! | EXPLANATIONS  | `explanations.>`                                 | 30 d | 2 GiB   |
//! | MODEL_METRICS | `metrics.model.*`                                | 90 d | 1 GiB   |
//! | ROUTING       | `routing.*`                                      | 7 d  | 512 MiB |
//! | DEAD_LETTER   | `dlq.>`                                          | 14 d | 1 GiB   |

use std::time::Duration;

use shared_types::{StreamDefinition, TypeError};

const DAY: u64 = 24 * 60 * 60;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

pub const MARKET_DATA: &str = "MARKET_DATA";
pub const PREDICTIONS: &str = "PREDICTIONS";
pub const EXPLANATIONS: &str = "EXPLANATIONS";
pub const MODEL_METRICS: &str = "MODEL_METRICS";
pub const ROUTING: &str = "ROUTING";
pub const DEAD_LETTER: &str = "DEAD_LETTER";

fn days(n: u64) -> Duration {
    Duration::from_secs(n * DAY)
}

/// Every platform stream, dead-letter stream last.
pub fn platform_streams(dlq_prefix: &str) -> Result<Vec<StreamDefinition>, TypeError> {
    Ok(vec![
        StreamDefinition::builder(MARKET_DATA)
            .subject("market.data.*")
            .description("Real-time market data updates")
            .max_age(days(7))
            .max_bytes(10 * GIB)
            .build()?,
        StreamDefinition::builder(PREDICTIONS)
            .subject("predictions.normal.*")
            .subject("predictions.earnings.*")
            .description("Stock price predictions from AI agents")
            .max_age(days(30))
            .max_bytes(5 * GIB)
            .build()?,
        StreamDefinition::builder(EXPLANATIONS)
            .subject("explanations.>")
            .description("Prediction explanation requests and results")
            .max_age(days(30))
            .max_bytes(2 * GIB)
            .build()?,
        StreamDefinition::builder(MODEL_METRICS)
            .subject("metrics.model.*")
            .description("Model performance metrics")
            .max_age(days(90))
            .max_bytes(GIB)
            .build()?,
        StreamDefinition::builder(ROUTING)
            .subject("routing.*")
            .description("Agent routing decisions")
            .max_age(days(7))
            .max_bytes(512 * MIB)
            .build()?,
        dead_letter_stream(dlq_prefix)?,
    ])
}

/// The dead-letter stream for `prefix`.
pub fn dead_letter_stream(prefix: &str) -> Result<StreamDefinition, TypeError> {
    StreamDefinition::builder(DEAD_LETTER)
        .subject(format!("{prefix}.>"))
        .description("Messages that could not be processed")
        .max_age(days(14))
        .max_bytes(GIB)
        .build()
}
