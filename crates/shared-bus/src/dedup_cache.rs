//! # Time-Bounded Dedup Window
//!
//! Remembers publisher-supplied dedup keys for a fixed window so that a
//! retried publish of the same key resolves to the original sequence instead
//! of a second copy.
//!
//! - Keys are valid only within the window after they were first recorded
//! - Expired keys are garbage-collected periodically
//! - This bounds memory while keeping retries idempotent

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A key recorded in the window.
#[derive(Debug, Clone, Copy)]
struct DedupEntry {
    sequence: u64,
    recorded_at: Instant,
}

/// Time-bounded dedup cache keyed by publisher-supplied id.
///
/// All methods take `now` explicitly so callers (and tests) control time.
#[derive(Debug)]
pub struct DedupWindow {
    /// key -> first sequence and when it was stored.
    entries: HashMap<String, DedupEntry>,

    /// How long a key suppresses duplicates.
    window: Duration,

    last_gc: Instant,

    gc_interval: Duration,
}

impl DedupWindow {
    /// Default garbage collection interval.
    pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(10);

    #[must_use]
    pub fn new(window: Duration, now: Instant) -> Self {
        Self::with_gc_interval(window, Self::DEFAULT_GC_INTERVAL, now)
    }

    #[must_use]
    pub fn with_gc_interval(window: Duration, gc_interval: Duration, now: Instant) -> Self {
        Self {
            entries: HashMap::new(),
            window,
            last_gc: now,
            gc_interval,
        }
    }

    /// Sequence the key was first stored under, if still inside the window.
    pub fn lookup(&mut self, key: &str, now: Instant) -> Option<u64> {
        if now.saturating_duration_since(self.last_gc) > self.gc_interval {
            self.garbage_collect(now);
            self.last_gc = now;
        }

        self.entries
            .get(key)
            .filter(|entry| now.saturating_duration_since(entry.recorded_at) < self.window)
            .map(|entry| entry.sequence)
    }

    /// Remember `key` as stored under `sequence`.
    pub fn record(&mut self, key: impl Into<String>, sequence: u64, now: Instant) {
        self.entries.insert(
            key.into(),
            DedupEntry {
                sequence,
                recorded_at: now,
            },
        );
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn garbage_collect(&mut self, now: Instant) {
        let window = self.window;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.recorded_at) < window);
    }
}
