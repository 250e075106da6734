//! Outbox record and its delivery state machine.
//!
//! Life of a row:
//!
//! ```text
//!   append (in the business tx)
//!          │ commit
//!          ▼
//!      PENDING ──claim (lease)──► send ──ok──► PUBLISHED
//!          ▲                        │
//!          │                       err
//!          │                        ▼
//!          └──── reschedule ───── FAILED (retry_count += 1)
//! ```
//!
//! A lease is not a status: a claimed row stays PENDING until the publisher
//! marks it, and an expired lease simply makes it claimable again. A FAILED
//! row whose `retry_count` reached the configured `max_retries` is a dead
//! letter. Only an explicit `reschedule` moves it again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::CourierError;
use super::ids::EventId;

/// Delivery status of an outbox event.
///
/// State transitions:
/// - Pending -> Published (terminal)
/// - Pending -> Failed (records last_error, increments retry_count)
/// - Failed -> Pending (explicit reschedule only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Published)
    }

    pub fn can_transition_to(self, next: OutboxStatus) -> bool {
        matches!(
            (self, next),
            (OutboxStatus::Pending, OutboxStatus::Published)
                | (OutboxStatus::Pending, OutboxStatus::Failed)
                | (OutboxStatus::Failed, OutboxStatus::Pending)
        )
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// An event waiting to be appended.
///
/// `event_id` is fixed here, before the row exists, so the producer can log or
/// correlate it while the enclosing transaction is still open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: String,
}

impl NewOutboxEvent {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            event_id: EventId::generate(),
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            payload: payload.into(),
        }
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }
}

/// Durable outbox row.
///
/// Design:
/// - `event_id` never changes once created.
/// - Only the store mutates a record, and only through the transition
///   methods below, which enforce `OutboxStatus::can_transition_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Store-assigned sequence; defines creation (FIFO) order.
    pub id: u64,
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: String,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OutboxEvent {
    pub fn from_new(id: u64, event: NewOutboxEvent, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            event_id: event.event_id,
            event_type: event.event_type,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            payload: event.payload,
            status: OutboxStatus::Pending,
            created_at,
            published_at: None,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Key used for per-aggregate ordering.
    pub fn aggregate_key(&self) -> (&str, &str) {
        (&self.aggregate_type, &self.aggregate_id)
    }

    fn transition(&mut self, next: OutboxStatus) -> Result<(), CourierError> {
        if !self.status.can_transition_to(next) {
            return Err(CourierError::InvalidTransition {
                event_id: self.event_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_published(&mut self, at: DateTime<Utc>) -> Result<(), CourierError> {
        self.transition(OutboxStatus::Published)?;
        self.published_at = Some(at);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), CourierError> {
        self.transition(OutboxStatus::Failed)?;
        self.last_error = Some(error.into());
        self.retry_count += 1;
        Ok(())
    }

    /// Failed -> Pending. `retry_count` and `last_error` are kept as history.
    pub fn reschedule(&mut self) -> Result<(), CourierError> {
        self.transition(OutboxStatus::Pending)
    }
}

/// Wire envelope handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl OutboxMessage {
    /// Payloads that are not valid JSON travel as a JSON string.
    pub fn from_event(event: &OutboxEvent) -> Self {
        let payload = serde_json::from_str(&event.payload)
            .unwrap_or_else(|_| serde_json::Value::String(event.payload.clone()));
        Self {
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            created_at: event.created_at,
            payload,
        }
    }
}
