//! Per-instance event store: an append-only FIFO of decoded trace records.
//!
//! Append is O(1) amortized. `fetch` returns a point-in-time snapshot and is
//! safe against the global eviction path removing entries from the front —
//! all mutation happens under the engine's state lock, so a snapshot never
//! observes a half-applied eviction.

use std::collections::VecDeque;

use crate::record::TraceRecord;

/// Ordered queue of one instance's retained trace records, with byte
/// accounting and per-instance flow counters.
#[derive(Debug, Default)]
pub struct EventStore {
    records: VecDeque<TraceRecord>,
    retained_bytes: usize,
    appended: u64,
    dropped: u64,
    parse_errors: u64,
}

impl EventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to the back of the queue.
    pub fn append(&mut self, record: TraceRecord) {
        self.retained_bytes += record.cost();
        self.appended += 1;
        self.records.push_back(record);
    }

    /// Snapshot of all currently retained records, in arrival order.
    #[must_use]
    pub fn fetch(&self) -> Vec<TraceRecord> {
        self.records.iter().cloned().collect()
    }

    /// The most recently appended record still retained.
    #[must_use]
    pub fn latest(&self) -> Option<&TraceRecord> {
        self.records.back()
    }

    /// Arrival sequence of the oldest retained record.
    #[must_use]
    pub fn oldest_seq(&self) -> Option<u64> {
        self.records.front().map(|r| r.seq)
    }

    /// Remove and return the oldest retained record, releasing its bytes.
    pub fn evict_oldest(&mut self) -> Option<TraceRecord> {
        let record = self.records.pop_front()?;
        self.retained_bytes = self.retained_bytes.saturating_sub(record.cost());
        Some(record)
    }

    /// Count one dropped record (budget rejection).
    pub fn note_dropped(&mut self) {
        self.dropped += 1;
    }

    /// Count one malformed line.
    pub fn note_parse_error(&mut self) {
        self.parse_errors += 1;
    }

    /// Number of currently retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes currently charged against the global budget by this store.
    #[must_use]
    pub fn retained_bytes(&self) -> usize {
        self.retained_bytes
    }

    /// Total records ever appended, including later-evicted ones.
    #[must_use]
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Records dropped because they never fit the budget.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Malformed lines seen on this instance's channel.
    #[must_use]
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }
}
