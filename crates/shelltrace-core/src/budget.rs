//! Global memory budget across every instance's event store.
//!
//! A single shared counter of retained bytes is compared against a
//! configured ceiling. Admission never blocks ingestion: a record that
//! would exceed the ceiling triggers eviction of the globally-oldest
//! retained records, and a record bigger than the whole ceiling is dropped
//! and counted. Eviction is not a backpressure signal to the producer; the
//! channel is always drained.

use serde::Serialize;

/// Admission decision for one incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The record fits without displacing anything.
    Fits,
    /// The record fits only after evicting older records.
    NeedsEviction,
    /// The record alone is larger than the ceiling; drop it.
    Oversized,
}

/// Aggregate budget counters, suitable for logging and metrics export.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSummary {
    /// Configured ceiling in bytes.
    pub ceiling_bytes: usize,
    /// Bytes currently retained across all stores.
    pub retained_bytes: usize,
    /// Records dropped because they could never fit.
    pub dropped_records: u64,
    /// Records evicted to make room for newer ones.
    pub evicted_records: u64,
}

/// Tracks and caps total bytes retained across all event stores.
#[derive(Debug)]
pub struct MemoryBudgetManager {
    ceiling: usize,
    retained: usize,
    dropped: u64,
    evicted: u64,
}

impl MemoryBudgetManager {
    /// Create a manager with the given ceiling in bytes.
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            retained: 0,
            dropped: 0,
            evicted: 0,
        }
    }

    /// Classify an incoming record of `cost` bytes.
    #[must_use]
    pub fn assess(&self, cost: usize) -> Admission {
        if cost > self.ceiling {
            Admission::Oversized
        } else if self.retained + cost > self.ceiling {
            Admission::NeedsEviction
        } else {
            Admission::Fits
        }
    }

    /// Charge an admitted record against the budget.
    pub fn charge(&mut self, cost: usize) {
        self.retained += cost;
    }

    /// Release bytes freed by eviction or reclamation.
    pub fn release(&mut self, cost: usize) {
        self.retained = self.retained.saturating_sub(cost);
    }

    /// Count one record dropped at admission.
    pub fn note_dropped(&mut self) {
        self.dropped += 1;
    }

    /// Count one record evicted to make room.
    pub fn note_evicted(&mut self) {
        self.evicted += 1;
    }

    /// Configured ceiling in bytes.
    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Bytes currently retained across all stores.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.retained
    }

    /// Records dropped because they never fit.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Current counters as a serializable summary.
    #[must_use]
    pub fn summary(&self) -> BudgetSummary {
        BudgetSummary {
            ceiling_bytes: self.ceiling,
            retained_bytes: self.retained,
            dropped_records: self.dropped,
            evicted_records: self.evicted,
        }
    }
}
