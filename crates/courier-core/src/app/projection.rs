//! Read-model projection.
//!
//! - `ProjectionTable`: event type -> updaters, fixed at startup
//! - `Projector`: N tokio workers applying published events to the table
//!
//! Events are routed to a worker by a hash of their aggregate, so the events
//! of one aggregate are applied in the order they were submitted. There is no
//! ordering across aggregates.
//!
//! An updater failure is logged and the event moves on. Projection never feeds
//! back into the outbox: an event is PUBLISHED whether or not a read model
//! managed to apply it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::domain::errors::CourierError;
use crate::domain::outbox::OutboxEvent;

#[async_trait]
pub trait ReadModelUpdater: Send + Sync {
    /// The single event type this updater subscribes to.
    fn event_type(&self) -> &str;

    async fn update(&self, event: &OutboxEvent) -> Result<(), CourierError>;
}

#[derive(Default, Clone)]
pub struct ProjectionTable {
    updaters: HashMap<String, Vec<Arc<dyn ReadModelUpdater>>>,
}

impl ProjectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(mut self, updater: Arc<dyn ReadModelUpdater>) -> Self {
        self.updaters
            .entry(updater.event_type().to_string())
            .or_default()
            .push(updater);
        self
    }

    pub fn updaters_for(&self, event_type: &str) -> &[Arc<dyn ReadModelUpdater>] {
        self.updaters
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.updaters.is_empty()
    }

    /// Run every updater subscribed to the event's type, in subscription order.
    /// Returns how many failed.
    pub async fn apply(&self, event: &OutboxEvent) -> usize {
        let mut failures = 0;
        for updater in self.updaters_for(&event.event_type) {
            if let Err(err) = updater.update(event).await {
                failures += 1;
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %err,
                    "read model update failed"
                );
            }
        }
        failures
    }
}

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    failed: AtomicU64,
}

/// Cloneable handle for feeding events to a running `Projector`.
#[derive(Clone)]
pub struct ProjectionSink {
    senders: Arc<[mpsc::Sender<OutboxEvent>]>,
}

impl ProjectionSink {
    /// Queue an event; waits while the target worker's queue is full.
    pub async fn submit(&self, event: OutboxEvent) -> Result<(), CourierError> {
        let worker = route(&event, self.senders.len());
        self.senders[worker]
            .send(event)
            .await
            .map_err(|_| CourierError::Other("projector has shut down".to_string()))
    }
}

fn route(event: &OutboxEvent, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    event.aggregate_key().hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

/// Worker pool handle.
/// - `sink()` hands out submit handles
/// - `shutdown_and_join()` drains what is queued, then stops the workers
pub struct Projector {
    sink: ProjectionSink,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl Projector {
    /// Spawn `workers` workers (at least one), each with a queue of `capacity`.
    pub fn spawn(workers: usize, capacity: usize, table: Arc<ProjectionTable>) -> Self {
        let workers = workers.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let mut senders = Vec::with_capacity(workers);
        let mut joins = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.push(tx);

            let table = Arc::clone(&table);
            let counters = Arc::clone(&counters);
            let shutdown_rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, table, counters, shutdown_rx).await;
            }));
        }

        Self {
            sink: ProjectionSink {
                senders: senders.into(),
            },
            shutdown_tx,
            joins,
            counters,
        }
    }

    pub fn sink(&self) -> ProjectionSink {
        self.sink.clone()
    }

    pub async fn submit(&self, event: OutboxEvent) -> Result<(), CourierError> {
        self.sink.submit(event).await
    }

    /// Events fully applied so far (every updater succeeded).
    pub fn applied(&self) -> u64 {
        self.counters.applied.load(Ordering::SeqCst)
    }

    /// Events with at least one failed updater.
    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                tracing::error!(error = %err, "projection worker panicked");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<OutboxEvent>,
    table: Arc<ProjectionTable>,
    counters: Arc<Counters>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            changed = shutdown_rx.changed() => {
                // a dropped Projector counts as shutdown
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(event) = event else {
            // every sender dropped
            return;
        };
        apply(&table, &counters, &event).await;
    }

    // drain what was queued before shutdown
    rx.close();
    while let Some(event) = rx.recv().await {
        apply(&table, &counters, &event).await;
    }
    tracing::debug!(worker_id, "projection worker stopped");
}

async fn apply(table: &ProjectionTable, counters: &Counters, event: &OutboxEvent) {
    if table.apply(event).await == 0 {
        counters.applied.fetch_add(1, Ordering::SeqCst);
    } else {
        counters.failed.fetch_add(1, Ordering::SeqCst);
    }
}
