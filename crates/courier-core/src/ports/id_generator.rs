//! IdGenerator port.
//!
//! Event ids are ULIDs whose timestamp part comes from the injected `Clock`,
//! so ids stay sortable by creation time even under a test clock.

use crate::domain::ids::{EventId, TxId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_event_id(&self) -> EventId;

    fn generate_tx_id(&self) -> TxId;
}

/// ULID based generator.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_event_id(&self) -> EventId {
        EventId::from(self.next_ulid())
    }

    fn generate_tx_id(&self) -> TxId {
        TxId::from(self.next_ulid())
    }
}
