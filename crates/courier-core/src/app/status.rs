use serde::{Deserialize, Serialize};

/// Outbox backlog by delivery state.
///
/// - `pending`: waiting to be claimed
/// - `in_flight`: PENDING but currently claimed by a publisher
/// - `failed`: FAILED and still below the retry cap
/// - `dead_lettered`: FAILED at the retry cap; only an operator reschedule revives them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub published: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl OutboxCounts {
    /// Events not yet delivered, dead letters included.
    pub fn undelivered(&self) -> usize {
        self.pending + self.in_flight + self.failed + self.dead_lettered
    }

    pub fn total(&self) -> usize {
        self.undelivered() + self.published
    }
}
