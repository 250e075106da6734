//! InMemoryTransactionManager - unit of work for the in-memory stores.
//!
//! # How a store takes part
//! A store joins the transaction by downcasting it (`InMemoryTransaction::join`)
//! and staging a `DeferredWrite`. Nothing is visible to other callers until
//! commit.
//!
//! # Commit
//! A write has two halves:
//! - `check`: may fail and must not change anything (version checks,
//!   uniqueness checks)
//! - `apply`: cannot fail and makes the change
//!
//! `commit` runs every check first, in staging order. The first failing check
//! ends the commit with that error unchanged, and no `apply` runs. Only when
//! all checks pass are the applies run, in the same order. So either every
//! staged write lands, or none does.
//!
//! Commits of one manager are serialized by a shared lock. Between a
//! transaction's checks and its applies no other transaction of that manager
//! can commit, so a passed check still holds when its write is applied. Stores
//! that take part in the same transactions must share one manager.
//!
//! # Rollback
//! `rollback` (or dropping the handle) discards the staged writes unrun.
//!
//! # Keys
//! `reserve` lets a store detect two writes for the same key staged in one
//! transaction, which neither write's check can see.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::domain::errors::CourierError;
use crate::domain::ids::TxId;
use crate::ports::{
    IdGenerator, SystemClock, Transaction, TransactionManager, TxMode, UlidGenerator,
};

/// A write staged in an `InMemoryTransaction`.
pub struct DeferredWrite {
    check: BoxFuture<'static, Result<(), CourierError>>,
    apply: BoxFuture<'static, ()>,
}

impl DeferredWrite {
    pub fn new<C, A>(check: C, apply: A) -> Self
    where
        C: Future<Output = Result<(), CourierError>> + Send + 'static,
        A: Future<Output = ()> + Send + 'static,
    {
        Self {
            check: check.boxed(),
            apply: apply.boxed(),
        }
    }

    /// A write with nothing to check.
    pub fn unchecked<A>(apply: A) -> Self
    where
        A: Future<Output = ()> + Send + 'static,
    {
        Self::new(async { Ok(()) }, apply)
    }
}

#[derive(Debug, Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

/// Snapshot of how many transactions were opened and how they ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

impl TxStats {
    /// Transactions begun but not yet committed or rolled back.
    pub fn open(&self) -> u64 {
        self.begun - self.committed - self.rolled_back
    }
}

pub struct InMemoryTransactionManager {
    ids: Arc<dyn IdGenerator>,
    counters: Arc<Counters>,
    commit_lock: Arc<Mutex<()>>,
}

impl InMemoryTransactionManager {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            ids,
            counters: Arc::new(Counters::default()),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn stats(&self) -> TxStats {
        TxStats {
            begun: self.counters.begun.load(Ordering::SeqCst),
            committed: self.counters.committed.load(Ordering::SeqCst),
            rolled_back: self.counters.rolled_back.load(Ordering::SeqCst),
        }
    }
}

impl Default for InMemoryTransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionManager for InMemoryTransactionManager {
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn Transaction>, CourierError> {
        self.counters.begun.fetch_add(1, Ordering::SeqCst);
        let tx = InMemoryTransaction {
            id: self.ids.generate_tx_id(),
            mode,
            writes: Vec::new(),
            reserved: HashSet::new(),
            counters: Arc::clone(&self.counters),
            commit_lock: Arc::clone(&self.commit_lock),
        };
        tracing::trace!(tx_id = %tx.id, ?mode, "transaction begun");
        Ok(Box::new(tx))
    }
}

pub struct InMemoryTransaction {
    id: TxId,
    mode: TxMode,
    writes: Vec<DeferredWrite>,
    reserved: HashSet<String>,
    counters: Arc<Counters>,
    commit_lock: Arc<Mutex<()>>,
}

impl InMemoryTransaction {
    /// Reach the in-memory transaction behind a `dyn Transaction`.
    pub fn join(tx: &mut dyn Transaction) -> Result<&mut InMemoryTransaction, CourierError> {
        let tx_id = tx.id();
        tx.as_any_mut()
            .downcast_mut::<InMemoryTransaction>()
            .ok_or_else(|| {
                CourierError::Transaction(format!(
                    "transaction {tx_id} is not an in-memory transaction"
                ))
            })
    }

    /// Stage a write to run on commit.
    pub fn defer(&mut self, write: DeferredWrite) -> Result<(), CourierError> {
        if self.mode.is_read_only() {
            return Err(CourierError::ReadOnlyTransaction);
        }
        self.writes.push(write);
        Ok(())
    }

    /// `false` if `key` was already reserved in this transaction.
    pub fn reserve(&mut self, key: impl Into<String>) -> bool {
        self.reserved.insert(key.into())
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    fn id(&self) -> TxId {
        self.id
    }

    fn mode(&self) -> TxMode {
        self.mode
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), CourierError> {
        let this = *self;
        let writes = this.writes.len();
        let _serialized = this.commit_lock.lock().await;

        let mut applies = Vec::with_capacity(writes);
        for write in this.writes {
            if let Err(err) = write.check.await {
                this.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(tx_id = %this.id, error = %err, "commit aborted, nothing applied");
                return Err(err);
            }
            applies.push(write.apply);
        }
        for apply in applies {
            apply.await;
        }

        this.counters.committed.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(tx_id = %this.id, writes, "transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), CourierError> {
        self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(tx_id = %self.id, discarded = self.writes.len(), "transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    type Log = Arc<StdMutex<Vec<&'static str>>>;

    fn push_write(log: &Log, entry: &'static str) -> DeferredWrite {
        let log = Arc::clone(log);
        DeferredWrite::unchecked(async move {
            log.lock().unwrap().push(entry);
        })
    }

    fn conflicting_write(log: &Log, entry: &'static str) -> DeferredWrite {
        let log = Arc::clone(log);
        DeferredWrite::new(
            async { Err(CourierError::ConcurrencyConflict("version 1 != 2".into())) },
            async move {
                log.lock().unwrap().push(entry);
            },
        )
    }

    #[tokio::test]
    async fn commit_applies_deferred_writes_in_order() {
        let manager = InMemoryTransactionManager::new();
        let log = Log::default();

        let mut tx = manager.begin(TxMode::ReadWrite).await.unwrap();
        let joined = InMemoryTransaction::join(tx.as_mut()).unwrap();
        joined.defer(push_write(&log, "first")).unwrap();
        joined.defer(push_write(&log, "second")).unwrap();
        assert_eq!(joined.pending_writes(), 2);

        assert!(log.lock().unwrap().is_empty());
        tx.commit().await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(
            manager.stats(),
            TxStats {
                begun: 1,
                committed: 1,
                rolled_back: 0
            }
        );
    }

    #[tokio::test]
    async fn rollback_discards_deferred_writes() {
        let manager = InMemoryTransactionManager::new();
        let log = Log::default();

        let mut tx = manager.begin(TxMode::ReadWrite).await.unwrap();
        InMemoryTransaction::join(tx.as_mut())
            .unwrap()
            .defer(push_write(&log, "lost"))
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(manager.stats().rolled_back, 1);
        assert_eq!(manager.stats().open(), 0);
    }

    #[tokio::test]
    async fn read_only_transaction_refuses_writes() {
        let manager = InMemoryTransactionManager::new();
        let log = Log::default();

        let mut tx = manager.begin(TxMode::ReadOnly).await.unwrap();
        let joined = InMemoryTransaction::join(tx.as_mut()).unwrap();
        let result = joined.defer(push_write(&log, "nope"));

        assert!(matches!(result, Err(CourierError::ReadOnlyTransaction)));
        assert_eq!(joined.pending_writes(), 0);
    }

    #[tokio::test]
    async fn failing_check_is_returned_unchanged() {
        let manager = InMemoryTransactionManager::new();

        let mut tx = manager.begin(TxMode::ReadWrite).await.unwrap();
        InMemoryTransaction::join(tx.as_mut())
            .unwrap()
            .defer(DeferredWrite::new(
                async { Err(CourierError::Storage("disk full".into())) },
                async {},
            ))
            .unwrap();

        assert!(matches!(
            tx.commit().await,
            Err(CourierError::Storage(ref msg)) if msg == "disk full"
        ));
        assert_eq!(manager.stats().committed, 0);
        assert_eq!(manager.stats().rolled_back, 1);
    }

    #[tokio::test]
    async fn failing_check_applies_nothing_whatever_its_position() {
        for failing_at in 0..3 {
            let manager = InMemoryTransactionManager::new();
            let log = Log::default();

            let mut tx = manager.begin(TxMode::ReadWrite).await.unwrap();
            let joined = InMemoryTransaction::join(tx.as_mut()).unwrap();
            for (i, entry) in ["a", "b", "c"].into_iter().enumerate() {
                let write = if i == failing_at {
                    conflicting_write(&log, entry)
                } else {
                    push_write(&log, entry)
                };
                joined.defer(write).unwrap();
            }

            let result = tx.commit().await;

            assert!(
                matches!(result, Err(CourierError::ConcurrencyConflict(_))),
                "failing write at {failing_at}"
            );
            assert!(log.lock().unwrap().is_empty(), "failing write at {failing_at}");
        }
    }

    #[tokio::test]
    async fn reserve_detects_a_key_staged_twice() {
        let manager = InMemoryTransactionManager::new();
        let mut tx = manager.begin(TxMode::ReadWrite).await.unwrap();
        let joined = InMemoryTransaction::join(tx.as_mut()).unwrap();

        assert!(joined.reserve("outbox:1"));
        assert!(!joined.reserve("outbox:1"));
        assert!(joined.reserve("outbox:2"));
    }

    #[tokio::test]
    async fn concurrent_commits_do_not_interleave() {
        let manager = Arc::new(InMemoryTransactionManager::new());
        let log = Log::default();

        let mut joins = Vec::new();
        for entry in ["x", "y"] {
            let manager = Arc::clone(&manager);
            let log = Arc::clone(&log);
            joins.push(tokio::spawn(async move {
                let mut tx = manager.begin(TxMode::ReadWrite).await.unwrap();
                let joined = InMemoryTransaction::join(tx.as_mut()).unwrap();
                for _ in 0..3 {
                    let log = Arc::clone(&log);
                    joined
                        .defer(DeferredWrite::unchecked(async move {
                            tokio::task::yield_now().await;
                            log.lock().unwrap().push(entry);
                        }))
                        .unwrap();
                }
                tx.commit().await.unwrap();
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        let log = log.lock().unwrap().clone();
        assert_eq!(log.len(), 6);
        assert!(log[..3].iter().all(|e| *e == log[0]));
        assert!(log[3..].iter().all(|e| *e == log[3]));
    }
}
