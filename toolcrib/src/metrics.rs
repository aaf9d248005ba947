//! Operational counters for the reservation service.
//!
//! Sequence fallbacks are counted separately from other failures so operators
//! can alert on them: every fallback reference breaks strict ordering.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// A counter at zero.
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Adds one.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters shared by every operation of one service instance.
#[derive(Debug, Default)]
pub struct ServiceMetrics {
    /// Batches committed.
    pub batches_created: Counter,
    /// References issued without the sequence counter.
    pub sequence_fallbacks: Counter,
    /// Creations rejected by a reservation conflict.
    pub conflicts: Counter,
    /// Transitions refused by a guard or a concurrent update.
    pub invalid_transitions: Counter,
    /// Transactions re-run after a transient store failure.
    pub retries: Counter,
}

/// Point-in-time copy of [`ServiceMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    /// See [`ServiceMetrics::batches_created`].
    pub batches_created: u64,
    /// See [`ServiceMetrics::sequence_fallbacks`].
    pub sequence_fallbacks: u64,
    /// See [`ServiceMetrics::conflicts`].
    pub conflicts: u64,
    /// See [`ServiceMetrics::invalid_transitions`].
    pub invalid_transitions: u64,
    /// See [`ServiceMetrics::retries`].
    pub retries: u64,
}

impl ServiceMetrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_created: self.batches_created.get(),
            sequence_fallbacks: self.sequence_fallbacks.get(),
            conflicts: self.conflicts.get(),
            invalid_transitions: self.invalid_transitions.get(),
            retries: self.retries.get(),
        }
    }
}
