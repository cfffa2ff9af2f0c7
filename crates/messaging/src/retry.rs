//! Per-consumer redelivery counting.

use dashmap::DashMap;

/// Counts redeliveries per consumer session.
#[derive(Debug, Default)]
pub struct RetryTracker {
    counts: DashMap<String, u32>,
}

impl RetryTracker {
    /// Records a redelivery seen by `consumer_tag`; returns the new count,
    /// starting at 1.
    pub fn record_redelivery(&self, consumer_tag: &str) -> u32 {
        let mut count = self.counts.entry(consumer_tag.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Forgets the count for `consumer_tag`.
    pub fn clear(&self, consumer_tag: &str) {
        self.counts.remove(consumer_tag);
    }

    /// The current count for `consumer_tag`.
    #[must_use]
    pub fn get(&self, consumer_tag: &str) -> u32 {
        self.counts.get(consumer_tag).map_or(0, |count| *count)
    }
}
