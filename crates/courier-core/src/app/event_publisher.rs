//! OutboxEventPublisher - turns domain events into outbox rows.
//!
//! Handlers call this with the transaction they were given, so the events
//! commit or roll back together with the state change that raised them.

use std::sync::Arc;

use crate::domain::errors::CourierError;
use crate::domain::events::DomainEvent;
use crate::domain::ids::EventId;
use crate::domain::outbox::NewOutboxEvent;
use crate::ports::{OutboxStore, Transaction};

#[derive(Clone)]
pub struct OutboxEventPublisher {
    store: Arc<dyn OutboxStore>,
}

impl OutboxEventPublisher {
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self { store }
    }

    /// Serialize `event` to JSON and append it. The outbox `event_id` is the
    /// event's own id, so consumers can de-duplicate on it.
    pub async fn publish<E: DomainEvent>(
        &self,
        tx: &mut dyn Transaction,
        event: &E,
    ) -> Result<EventId, CourierError> {
        let payload = serde_json::to_string(event)?;
        let record = NewOutboxEvent::new(
            event.event_type(),
            event.aggregate_type(),
            event.aggregate_id(),
            payload,
        )
        .with_event_id(event.event_id());

        let event_id = self.store.append(tx, record).await?;
        tracing::debug!(
            %event_id,
            event_type = event.event_type(),
            aggregate_id = %event.aggregate_id(),
            "domain event appended to outbox"
        );
        Ok(event_id)
    }

    pub async fn publish_all<E: DomainEvent>(
        &self,
        tx: &mut dyn Transaction,
        events: Vec<E>,
    ) -> Result<Vec<EventId>, CourierError> {
        let mut ids = Vec::with_capacity(events.len());
        for event in &events {
            ids.push(self.publish(tx, event).await?);
        }
        Ok(ids)
    }
}
