//! OutboxStore port - durable log of domain events awaiting delivery.
//!
//! # Contract
//! - `append` joins the caller's transaction and never commits on its own:
//!   the event and the business change it describes land together or not at all.
//! - `claim_batch` is atomic (claim-and-mark in one step), so two publishers
//!   never receive the same event. Claims expire after the store's claim
//!   timeout, which makes a crashed publisher's batch deliverable again.
//! - Events come back oldest first, and an event is never handed out while an
//!   older event of the same aggregate is still unpublished.

use async_trait::async_trait;

use crate::app::status::OutboxCounts;
use crate::domain::errors::CourierError;
use crate::domain::ids::EventId;
use crate::domain::outbox::{NewOutboxEvent, OutboxEvent};
use crate::ports::Transaction;

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn append(
        &self,
        tx: &mut dyn Transaction,
        event: NewOutboxEvent,
    ) -> Result<EventId, CourierError>;

    /// Claim up to `limit` pending events.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxEvent>, CourierError>;

    async fn mark_published(&self, event_id: EventId) -> Result<(), CourierError>;

    async fn mark_failed(&self, event_id: EventId, error: &str) -> Result<(), CourierError>;

    /// Give a claimed event back without changing its status.
    async fn release(&self, event_id: EventId) -> Result<(), CourierError>;

    /// Explicit FAILED -> PENDING (operator action, no retry cap).
    async fn reschedule(&self, event_id: EventId) -> Result<(), CourierError>;

    /// Scheduler sweep: FAILED -> PENDING for events below `max_retries`.
    /// Returns how many events were rescheduled.
    async fn reschedule_failed(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<usize, CourierError>;

    /// FAILED events that reached `max_retries`.
    async fn dead_letters(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, CourierError>;

    async fn get(&self, event_id: EventId) -> Result<Option<OutboxEvent>, CourierError>;

    async fn counts_by_status(&self, max_retries: u32) -> Result<OutboxCounts, CourierError>;
}
