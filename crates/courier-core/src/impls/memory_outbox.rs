//! InMemoryOutboxStore - outbox rows kept in process memory.
//!
//! # Design
//! - Rows live in a `BTreeMap` keyed by the store-assigned id, so iteration is
//!   creation (commit) order.
//! - `append` joins the caller's `InMemoryTransaction`: the row is inserted by a
//!   deferred write and only exists after commit. The duplicate-id check runs
//!   again at commit, so an id committed meanwhile by another transaction
//!   fails the whole commit, including the caller's other writes.
//! - Every state change happens under one `tokio::sync::Mutex`, which makes
//!   claim-and-mark a single atomic step.
//! - A claim is a lease (`claimed_until`). An expired lease makes the event
//!   claimable again.
//! - Ordering per aggregate: while an older event of an aggregate is unpublished
//!   and not claimable (leased elsewhere, or FAILED), none of that aggregate's
//!   newer events are handed out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::app::status::OutboxCounts;
use crate::domain::errors::CourierError;
use crate::domain::ids::EventId;
use crate::domain::outbox::{NewOutboxEvent, OutboxEvent, OutboxStatus};
use crate::impls::memory_tx::{DeferredWrite, InMemoryTransaction};
use crate::ports::{Clock, OutboxStore, SystemClock, Transaction};

const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

struct Row {
    event: OutboxEvent,
    claimed_until: Option<DateTime<Utc>>,
}

impl Row {
    fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.claimed_until.is_some_and(|until| until > now)
    }

    fn aggregate_key(&self) -> (String, String) {
        (
            self.event.aggregate_type.clone(),
            self.event.aggregate_id.clone(),
        )
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    rows: BTreeMap<u64, Row>,
    by_event: HashMap<EventId, u64>,
}

impl State {
    fn contains(&self, event_id: EventId) -> bool {
        self.by_event.contains_key(&event_id)
    }

    /// Callers check `contains` first, in the same commit.
    fn insert(&mut self, event: NewOutboxEvent, now: DateTime<Utc>) {
        self.next_id += 1;
        let id = self.next_id;
        self.by_event.insert(event.event_id, id);
        self.rows.insert(
            id,
            Row {
                event: OutboxEvent::from_new(id, event, now),
                claimed_until: None,
            },
        );
    }

    fn row_mut(&mut self, event_id: EventId) -> Result<&mut Row, CourierError> {
        self.by_event
            .get(&event_id)
            .and_then(|id| self.rows.get_mut(id))
            .ok_or(CourierError::EventNotFound(event_id))
    }
}

pub struct InMemoryOutboxStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    claim_timeout: Duration,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    /// Every row, oldest first.
    pub async fn snapshot(&self) -> Vec<OutboxEvent> {
        let state = self.state.lock().await;
        state.rows.values().map(|row| row.event.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.claim_timeout)
            .ok()
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(
        &self,
        tx: &mut dyn Transaction,
        event: NewOutboxEvent,
    ) -> Result<EventId, CourierError> {
        let event_id = event.event_id;
        let tx = InMemoryTransaction::join(tx)?;
        let committed = self.state.lock().await.contains(event_id);
        if committed || !tx.reserve(format!("outbox:{event_id}")) {
            return Err(CourierError::DuplicateEvent(event_id));
        }

        // another transaction may commit the same id before this one does
        let check_state = Arc::clone(&self.state);
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        tx.defer(DeferredWrite::new(
            async move {
                if check_state.lock().await.contains(event_id) {
                    return Err(CourierError::DuplicateEvent(event_id));
                }
                Ok(())
            },
            async move {
                let now = clock.now();
                state.lock().await.insert(event, now);
            },
        ))?;
        Ok(event_id)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxEvent>, CourierError> {
        let now = self.clock.now();
        let lease_until = self.lease_until(now);
        let mut state = self.state.lock().await;

        let mut blocked: HashSet<(String, String)> = HashSet::new();
        let mut claimed = Vec::new();
        for row in state.rows.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            match row.event.status {
                OutboxStatus::Published => {}
                OutboxStatus::Failed => {
                    blocked.insert(row.aggregate_key());
                }
                OutboxStatus::Pending => {
                    let key = row.aggregate_key();
                    if blocked.contains(&key) {
                        continue;
                    }
                    if row.is_leased(now) {
                        blocked.insert(key);
                        continue;
                    }
                    row.claimed_until = Some(lease_until);
                    claimed.push(row.event.clone());
                }
            }
        }

        if !claimed.is_empty() {
            tracing::debug!(claimed = claimed.len(), limit, "outbox batch claimed");
        }
        Ok(claimed)
    }

    async fn mark_published(&self, event_id: EventId) -> Result<(), CourierError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let row = state.row_mut(event_id)?;
        row.event.mark_published(now)?;
        row.claimed_until = None;
        Ok(())
    }

    async fn mark_failed(&self, event_id: EventId, error: &str) -> Result<(), CourierError> {
        let mut state = self.state.lock().await;
        let row = state.row_mut(event_id)?;
        row.event.mark_failed(error)?;
        row.claimed_until = None;
        Ok(())
    }

    async fn release(&self, event_id: EventId) -> Result<(), CourierError> {
        let mut state = self.state.lock().await;
        state.row_mut(event_id)?.claimed_until = None;
        Ok(())
    }

    async fn reschedule(&self, event_id: EventId) -> Result<(), CourierError> {
        let mut state = self.state.lock().await;
        let row = state.row_mut(event_id)?;
        row.event.reschedule()?;
        row.claimed_until = None;
        Ok(())
    }

    async fn reschedule_failed(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<usize, CourierError> {
        let mut state = self.state.lock().await;
        let mut rescheduled = 0;
        for row in state.rows.values_mut() {
            if rescheduled >= limit {
                break;
            }
            if row.event.status == OutboxStatus::Failed && row.event.retry_count < max_retries {
                row.event.reschedule()?;
                row.claimed_until = None;
                rescheduled += 1;
            }
        }
        Ok(rescheduled)
    }

    async fn dead_letters(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, CourierError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|row| {
                row.event.status == OutboxStatus::Failed && row.event.retry_count >= max_retries
            })
            .take(limit)
            .map(|row| row.event.clone())
            .collect())
    }

    async fn get(&self, event_id: EventId) -> Result<Option<OutboxEvent>, CourierError> {
        let state = self.state.lock().await;
        Ok(state
            .by_event
            .get(&event_id)
            .and_then(|id| state.rows.get(id))
            .map(|row| row.event.clone()))
    }

    async fn counts_by_status(&self, max_retries: u32) -> Result<OutboxCounts, CourierError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut counts = OutboxCounts::default();
        for row in state.rows.values() {
            match row.event.status {
                OutboxStatus::Pending if row.is_leased(now) => counts.in_flight += 1,
                OutboxStatus::Pending => counts.pending += 1,
                OutboxStatus::Published => counts.published += 1,
                OutboxStatus::Failed if row.event.retry_count >= max_retries => {
                    counts.dead_lettered += 1
                }
                OutboxStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryTransactionManager;
    use crate::ports::{FixedClock, TransactionManager, TxMode};
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn event(aggregate_id: &str) -> NewOutboxEvent {
        NewOutboxEvent::new("MoneyDeposited", "Account", aggregate_id, r#"{"amount":1}"#)
    }

    async fn append_committed(
        store: &InMemoryOutboxStore,
        manager: &InMemoryTransactionManager,
        new: NewOutboxEvent,
    ) -> EventId {
        let mut tx = manager.begin(TxMode::ReadWrite).await.unwrap();
        let id = store.append(tx.as_mut(), new).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    fn fixed_clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn claim_publish_then_nothing_left() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();
        let e1 = append_committed(&store, &manager, event("A1")).await;

        let batch = store.claim_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_id, e1);
        assert_eq!(batch[0].aggregate_id, "A1");
        assert_eq!(batch[0].status, OutboxStatus::Pending);

        store.mark_published(e1).await.unwrap();

        assert!(store.claim_batch(10).await.unwrap().is_empty());
        let stored = store.get(e1).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Published);
        assert!(stored.published_at.is_some());
    }

    #[tokio::test]
    async fn append_is_discarded_on_rollback() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();

        let mut tx = manager.begin(TxMode::ReadWrite).await.unwrap();
        let id = store.append(tx.as_mut(), event("A1")).await.unwrap();
        // handler fails after appending
        tx.rollback().await.unwrap();

        assert!(store.get(id).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn append_is_invisible_until_commit() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();

        let mut tx = manager.begin(TxMode::ReadWrite).await.unwrap();
        store.append(tx.as_mut(), event("A1")).await.unwrap();

        assert!(store.claim_batch(10).await.unwrap().is_empty());
        tx.commit().await.unwrap();
        assert_eq!(store.claim_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn read_only_transaction_cannot_append() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();

        let mut tx = manager.begin(TxMode::ReadOnly).await.unwrap();
        let result = store.append(tx.as_mut(), event("A1")).await;

        assert!(matches!(result, Err(CourierError::ReadOnlyTransaction)));
        tx.commit().await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_event_id_is_rejected() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();
        let first = event("A1");
        let duplicate = event("A2").with_event_id(first.event_id);
        append_committed(&store, &manager, first).await;

        let mut tx = manager.begin(TxMode::ReadWrite).await.unwrap();
        let result = store.append(tx.as_mut(), duplicate).await;

        assert!(matches!(result, Err(CourierError::DuplicateEvent(_))));
    }

    #[tokio::test]
    async fn same_event_id_twice_in_one_transaction_is_rejected() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();
        let first = event("A1");
        let again = event("A1").with_event_id(first.event_id);

        let mut tx = manager.begin(TxMode::ReadWrite).await.unwrap();
        store.append(tx.as_mut(), first).await.unwrap();
        let result = store.append(tx.as_mut(), again).await;

        assert!(matches!(result, Err(CourierError::DuplicateEvent(_))));
        tx.commit().await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn failed_version_check_discards_the_appended_event() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();

        // event appended before the aggregate save, whose check fails at commit
        let mut tx = manager.begin(TxMode::ReadWrite).await.unwrap();
        let id = store.append(tx.as_mut(), event("A1")).await.unwrap();
        InMemoryTransaction::join(tx.as_mut())
            .unwrap()
            .defer(DeferredWrite::new(
                async { Err(CourierError::ConcurrencyConflict("version 1 != 2".into())) },
                async {},
            ))
            .unwrap();

        let result = tx.commit().await;

        assert!(matches!(result, Err(CourierError::ConcurrencyConflict(_))));
        assert!(store.get(id).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_committed_meanwhile_discards_the_business_write() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();
        let balance = Arc::new(std::sync::Mutex::new(0_i64));
        let shared = event("A1");
        let raced = event("A1").with_event_id(shared.event_id);

        let mut tx_a = manager.begin(TxMode::ReadWrite).await.unwrap();
        let mut tx_b = manager.begin(TxMode::ReadWrite).await.unwrap();
        store.append(tx_a.as_mut(), shared).await.unwrap();
        let written = Arc::clone(&balance);
        InMemoryTransaction::join(tx_b.as_mut())
            .unwrap()
            .defer(DeferredWrite::unchecked(async move {
                *written.lock().unwrap() = 100;
            }))
            .unwrap();
        store.append(tx_b.as_mut(), raced).await.unwrap();

        tx_a.commit().await.unwrap();
        let result = tx_b.commit().await;

        assert!(matches!(result, Err(CourierError::DuplicateEvent(_))));
        assert_eq!(*balance.lock().unwrap(), 0);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn mark_failed_then_reschedule() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();
        let e1 = append_committed(&store, &manager, event("A1")).await;
        store.claim_batch(10).await.unwrap();

        store.mark_failed(e1, "timeout").await.unwrap();
        let failed = store.get(e1).await.unwrap().unwrap();
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));

        store.reschedule(e1).await.unwrap();
        let pending = store.get(e1).await.unwrap().unwrap();
        assert_eq!(pending.status, OutboxStatus::Pending);
        assert_eq!(pending.retry_count, 1);
        assert_eq!(store.claim_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn published_event_cannot_be_failed() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();
        let e1 = append_committed(&store, &manager, event("A1")).await;
        store.mark_published(e1).await.unwrap();

        assert!(matches!(
            store.mark_failed(e1, "late").await,
            Err(CourierError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.reschedule(e1).await,
            Err(CourierError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let store = InMemoryOutboxStore::new();
        assert!(matches!(
            store.mark_published(EventId::generate()).await,
            Err(CourierError::EventNotFound(_))
        ));
    }

    #[tokio::test]
    async fn claims_are_returned_oldest_first_and_respect_limit() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();
        let mut ids = Vec::new();
        for aggregate in ["A1", "A2", "A3", "A4"] {
            ids.push(append_committed(&store, &manager, event(aggregate)).await);
        }

        let first = store.claim_batch(3).await.unwrap();
        let second = store.claim_batch(3).await.unwrap();

        assert_eq!(
            first.iter().map(|e| e.event_id).collect::<Vec<_>>(),
            ids[..3].to_vec()
        );
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].event_id, ids[3]);
        assert!(first.windows(2).all(|pair| pair[0].id < pair[1].id));
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_an_event() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let manager = InMemoryTransactionManager::new();
        for i in 0..50 {
            append_committed(&store, &manager, event(&format!("A{i}"))).await;
        }

        let mut joins = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move { store.claim_batch(20).await.unwrap() }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for join in joins {
            for claimed in join.await.unwrap() {
                assert!(seen.insert(claimed.event_id), "event claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn expired_claims_become_claimable_again() {
        let clock = fixed_clock();
        let store = InMemoryOutboxStore::with_clock(clock.clone())
            .with_claim_timeout(Duration::from_secs(30));
        let manager = InMemoryTransactionManager::new();
        let e1 = append_committed(&store, &manager, event("A1")).await;

        assert_eq!(store.claim_batch(10).await.unwrap().len(), 1);
        assert!(store.claim_batch(10).await.unwrap().is_empty());

        // publisher crashed; lease runs out
        clock.advance(Duration::from_secs(31));
        let again = store.claim_batch(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].event_id, e1);
    }

    #[tokio::test]
    async fn release_returns_event_to_the_pool() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();
        let e1 = append_committed(&store, &manager, event("A1")).await;
        store.claim_batch(10).await.unwrap();

        store.release(e1).await.unwrap();

        assert_eq!(store.claim_batch(10).await.unwrap()[0].event_id, e1);
    }

    #[tokio::test]
    async fn aggregate_is_blocked_behind_its_oldest_undelivered_event() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();
        let a1_first = append_committed(&store, &manager, event("A1")).await;
        let a1_second = append_committed(&store, &manager, event("A1")).await;
        let b1 = append_committed(&store, &manager, event("B1")).await;

        // one publisher holds only A1's first event
        let held = store.claim_batch(1).await.unwrap();
        assert_eq!(held[0].event_id, a1_first);

        // another publisher must skip A1 entirely but may take B1
        let other = store.claim_batch(10).await.unwrap();
        assert_eq!(other.iter().map(|e| e.event_id).collect::<Vec<_>>(), vec![b1]);

        // a FAILED head keeps blocking the aggregate
        store.mark_failed(a1_first, "broker down").await.unwrap();
        assert!(store.claim_batch(10).await.unwrap().is_empty());

        store.reschedule(a1_first).await.unwrap();
        let resumed = store.claim_batch(10).await.unwrap();
        assert_eq!(
            resumed.iter().map(|e| e.event_id).collect::<Vec<_>>(),
            vec![a1_first, a1_second]
        );
    }

    #[tokio::test]
    async fn sweep_reschedules_below_cap_and_keeps_dead_letters() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();
        let retryable = append_committed(&store, &manager, event("A1")).await;
        let exhausted = append_committed(&store, &manager, event("B1")).await;

        store.mark_failed(retryable, "timeout").await.unwrap();
        for _ in 0..2 {
            store.mark_failed(exhausted, "timeout").await.unwrap();
            store.reschedule(exhausted).await.unwrap();
        }
        store.mark_failed(exhausted, "timeout").await.unwrap();

        let rescheduled = store.reschedule_failed(3, 100).await.unwrap();

        assert_eq!(rescheduled, 1);
        assert_eq!(
            store.get(retryable).await.unwrap().unwrap().status,
            OutboxStatus::Pending
        );
        let dead = store.dead_letters(3, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event_id, exhausted);
        assert_eq!(dead[0].retry_count, 3);

        let counts = store.counts_by_status(3).await.unwrap();
        assert_eq!(
            counts,
            OutboxCounts {
                pending: 1,
                in_flight: 0,
                published: 0,
                failed: 0,
                dead_lettered: 1,
            }
        );
    }

    #[tokio::test]
    async fn counts_distinguish_leased_events() {
        let store = InMemoryOutboxStore::new();
        let manager = InMemoryTransactionManager::new();
        append_committed(&store, &manager, event("A1")).await;
        append_committed(&store, &manager, event("B1")).await;
        store.claim_batch(1).await.unwrap();

        let counts = store.counts_by_status(5).await.unwrap();
        assert_eq!(counts.in_flight, 1);
        assert_eq!(counts.pending, 1);
    }
}
