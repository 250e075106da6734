//! OutboxPublisher - drains the outbox into the message transport.
//!
//! # One pass (`run_once`)
//! 1. `claim_batch(batch_size)`: oldest first, atomically leased
//! 2. per event: send `OutboxMessage` JSON to `{topic_prefix}.{aggregate_type}`
//!    - ok  -> `mark_published`, forward to the projection sink
//!    - err -> `mark_failed`; the rest of that aggregate's events in this
//!      batch are released untouched, so a later event never overtakes a
//!      failed one
//!
//! # Loop (`run`)
//! Optional reschedule sweep, then a pass, then sleep for `poll_interval`
//! unless the batch came back full. Stops when the shutdown watch turns true.
//!
//! Delivery is at-least-once. A crash between `send` and `mark_published`
//! leaves the lease to expire and the event is sent again.
//!
//! Only `claim_batch` failing ends a pass early, and then nothing is claimed.
//! A per-event `mark_*`/`release` error is logged and the pass goes on with
//! the rest of the batch. The usual cause is a lease that expired mid-send.
//! Another publisher then re-claimed and settled the event.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::projection::ProjectionSink;
use crate::config::OutboxConfig;
use crate::domain::errors::CourierError;
use crate::domain::outbox::{OutboxEvent, OutboxMessage};
use crate::ports::{MessageTransport, OutboxStore};

/// Outcome of one `run_once` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    /// Released without a send attempt because an earlier event of the same
    /// aggregate failed in this pass.
    pub deferred: usize,
}

pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn MessageTransport>,
    config: OutboxConfig,
    projection: Option<ProjectionSink>,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn MessageTransport>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            projection: None,
        }
    }

    /// Forward every published event to a projector.
    pub fn with_projection(mut self, sink: ProjectionSink) -> Self {
        self.projection = Some(sink);
        self
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<PublishReport, CourierError> {
        let batch = self.store.claim_batch(self.config.batch_size).await?;
        let mut report = PublishReport {
            claimed: batch.len(),
            ..PublishReport::default()
        };
        let mut halted: HashSet<(String, String)> = HashSet::new();

        for event in batch {
            let key = (event.aggregate_type.clone(), event.aggregate_id.clone());
            if halted.contains(&key) {
                if let Err(err) = self.store.release(event.event_id).await {
                    // the lease runs out on its own
                    tracing::warn!(
                        event_id = %event.event_id,
                        error = %err,
                        "outbox release failed"
                    );
                }
                report.deferred += 1;
                continue;
            }

            match self.deliver(&event).await {
                Ok(()) => match self.store.mark_published(event.event_id).await {
                    Ok(()) => {
                        report.published += 1;
                        self.project(event).await;
                    }
                    Err(err) => {
                        // usually our lease expired mid-send and another
                        // publisher settled the event
                        tracing::warn!(
                            event_id = %event.event_id,
                            error = %err,
                            "sent outbox event could not be marked published"
                        );
                    }
                },
                Err(err) => {
                    tracing::error!(
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        aggregate_id = %event.aggregate_id,
                        retry_count = event.retry_count,
                        error = %err,
                        "outbox publish failed"
                    );
                    if let Err(mark_err) =
                        self.store.mark_failed(event.event_id, &err.to_string()).await
                    {
                        tracing::warn!(
                            event_id = %event.event_id,
                            error = %mark_err,
                            "failed outbox event could not be marked failed"
                        );
                    }
                    report.failed += 1;
                    halted.insert(key);
                }
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                claimed = report.claimed,
                published = report.published,
                failed = report.failed,
                deferred = report.deferred,
                "outbox batch processed"
            );
        }
        Ok(report)
    }

    /// FAILED -> PENDING for events below `max_retries`.
    pub async fn reschedule_failed(&self) -> Result<usize, CourierError> {
        let rescheduled = self
            .store
            .reschedule_failed(self.config.max_retries, self.config.batch_size)
            .await?;
        if rescheduled > 0 {
            tracing::info!(rescheduled, "failed outbox events rescheduled");
        }
        Ok(rescheduled)
    }

    /// Poll until `shutdown` becomes true (or its sender is dropped).
    /// Pass errors are logged and the loop carries on.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_millis,
            "outbox publisher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.config.reschedule_failed
                && let Err(err) = self.reschedule_failed().await
            {
                tracing::error!(error = %err, "outbox reschedule sweep failed");
            }

            let drained_full_batch = match self.run_once().await {
                Ok(report) => report.claimed >= self.config.batch_size,
                Err(err) => {
                    tracing::error!(error = %err, "outbox publish pass failed");
                    false
                }
            };
            if drained_full_batch {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("outbox publisher stopped");
    }

    async fn deliver(&self, event: &OutboxEvent) -> Result<(), CourierError> {
        let topic = self.config.topic_for(&event.aggregate_type);
        let body = serde_json::to_vec(&OutboxMessage::from_event(event))?;
        self.transport.send(&topic, &body).await
    }

    async fn project(&self, event: OutboxEvent) {
        let Some(sink) = &self.projection else {
            return;
        };
        let event_id = event.event_id;
        if let Err(err) = sink.submit(event).await {
            tracing::warn!(%event_id, error = %err, "published event not projected");
        }
    }
}
