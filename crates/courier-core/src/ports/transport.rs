//! MessageTransport port - the external broker the outbox publisher feeds.

use async_trait::async_trait;

use crate::domain::errors::CourierError;

/// Sends one serialized event to a topic.
///
/// Delivery is at-least-once: the same event may be sent again after a
/// publisher crash, so consumers de-duplicate on `event_id`.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, topic: &str, message: &[u8]) -> Result<(), CourierError>;
}
