//! Domain events raised by aggregates.
//!
//! Events are buffered on the aggregate (`AggregateEvents`) while a command
//! handler runs and are then written to the outbox in the same transaction
//! (see `app::event_publisher`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::EventId;

/// Identity and timing shared by every domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: EventId,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

impl EventMetadata {
    pub fn new(occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: EventId::generate(),
            occurred_at,
            correlation_id: None,
            causation_id: None,
        }
    }

    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// Something that happened inside a bounded context.
///
/// ```ignore
/// #[derive(Serialize)]
/// struct AccountOpened { meta: EventMetadata, account_id: String }
///
/// impl DomainEvent for AccountOpened {
///     fn event_type(&self) -> &str { "AccountOpened" }
///     fn aggregate_type(&self) -> &str { "Account" }
///     fn aggregate_id(&self) -> String { self.account_id.clone() }
///     fn metadata(&self) -> &EventMetadata { &self.meta }
/// }
/// ```
pub trait DomainEvent: Serialize + Send + Sync {
    fn event_type(&self) -> &str;

    fn aggregate_type(&self) -> &str;

    fn aggregate_id(&self) -> String;

    fn metadata(&self) -> &EventMetadata;

    fn event_id(&self) -> EventId {
        self.metadata().event_id
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata().occurred_at
    }
}

/// Events recorded by an aggregate and not yet handed to the outbox.
#[derive(Debug, Clone)]
pub struct AggregateEvents<E> {
    pending: Vec<E>,
}

impl<E> AggregateEvents<E> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    pub fn record(&mut self, event: E) {
        self.pending.push(event);
    }

    pub fn pending(&self) -> &[E] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drain the buffer, leaving it empty.
    pub fn take(&mut self) -> Vec<E> {
        std::mem::take(&mut self.pending)
    }
}

impl<E> Default for AggregateEvents<E> {
    fn default() -> Self {
        Self::new()
    }
}
