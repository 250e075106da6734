//! CommandBus / QueryBus - resolve, then run the handler in a transaction.
//!
//! # Dispatch
//! 1. look the handler up in the memoized cache, falling back to the registry
//! 2. open a transaction (read-write for commands, read-only for queries)
//! 3. run the handler; commit on `Ok`, roll back on `Err`
//!
//! Resolution happens before the transaction is opened, so a wiring error never
//! costs a begin/rollback pair.
//!
//! # Cache
//! The cache is a `DashMap` in front of the immutable registry. Two workers
//! resolving the same type at once both compute the same `Arc` and the second
//! insert is a no-op, so no lock is held across resolution. Cold and warm
//! lookups always yield the same handler object.

use dashmap::DashMap;
use futures::FutureExt;
use std::sync::Arc;

use super::retry::{Retrier, RetryOptions, RetryPolicy};
use super::transactional::TransactionalExecutor;
use crate::cqrs::{Command, DynHandler, HandlerRegistry, InputType, Query};
use crate::domain::errors::{CourierError, HandlerCategory};
use crate::ports::{TransactionManager, TxMode};

type CacheKey = (HandlerCategory, InputType);

struct HandlerCache {
    registry: Arc<HandlerRegistry>,
    resolved: DashMap<CacheKey, Arc<dyn DynHandler>>,
}

impl HandlerCache {
    fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            resolved: DashMap::new(),
        }
    }

    fn resolve(
        &self,
        category: HandlerCategory,
        input_type: InputType,
    ) -> Result<Arc<dyn DynHandler>, CourierError> {
        let key = (category, input_type);
        if let Some(hit) = self.resolved.get(&key) {
            return Ok(Arc::clone(hit.value()));
        }

        let handler = self.registry.resolve(category, input_type)?;
        tracing::debug!(%category, input_type = input_type.name(), "handler resolved");
        let entry = self.resolved.entry(key).or_insert(handler);
        Ok(Arc::clone(entry.value()))
    }

    fn cached(
        &self,
        category: HandlerCategory,
        input_type: InputType,
    ) -> Option<Arc<dyn DynHandler>> {
        self.resolved
            .get(&(category, input_type))
            .map(|hit| Arc::clone(hit.value()))
    }
}

pub struct CommandBus {
    handlers: HandlerCache,
    executor: TransactionalExecutor,
}

impl CommandBus {
    pub fn new(registry: Arc<HandlerRegistry>, manager: Arc<dyn TransactionManager>) -> Self {
        Self {
            handlers: HandlerCache::new(registry),
            executor: TransactionalExecutor::new(manager),
        }
    }

    pub async fn dispatch<C: Command>(&self, command: C) -> Result<(), CourierError> {
        let handler = self
            .handlers
            .resolve(HandlerCategory::Command, InputType::of::<C>())?;

        self.executor
            .execute(TxMode::ReadWrite, move |tx| {
                async move {
                    handler.handle_dyn(Box::new(command), tx).await?;
                    Ok(())
                }
                .boxed()
            })
            .await
    }

    /// Dispatch a command whose handler returns `R`.
    ///
    /// The handler's declared output is checked against `R` before the
    /// transaction opens; a mismatch is `ResultTypeMismatch`.
    pub async fn dispatch_with_result<C, R>(&self, command: C) -> Result<R, CourierError>
    where
        C: Command,
        R: Send + 'static,
    {
        let input_type = InputType::of::<C>();
        let handler = self
            .handlers
            .resolve(HandlerCategory::CommandWithResult, input_type)?;

        let expected = InputType::of::<R>();
        let actual = handler.output_type();
        let mismatch = move || CourierError::ResultTypeMismatch {
            input_type: input_type.name(),
            expected: expected.name(),
            actual: actual.name(),
        };
        if actual != expected {
            return Err(mismatch());
        }

        self.executor
            .execute(TxMode::ReadWrite, move |tx| {
                async move {
                    let output = handler.handle_dyn(Box::new(command), tx).await?;
                    output.downcast::<R>().map(|boxed| *boxed).map_err(|_| mismatch())
                }
                .boxed()
            })
            .await
    }

    /// `dispatch` wrapped in a retrier. Every attempt is a fresh transaction
    /// on a fresh clone of the command.
    pub async fn dispatch_retrying<C, P>(
        &self,
        retrier: &Retrier<P>,
        options: RetryOptions,
        command: C,
    ) -> Result<(), CourierError>
    where
        C: Command + Clone,
        P: RetryPolicy,
    {
        retrier
            .run(options, |_attempt| self.dispatch(command.clone()))
            .await
    }

    /// Handler already memoized for `C`, if any.
    pub fn cached_handler<C: Command>(
        &self,
        category: HandlerCategory,
    ) -> Option<Arc<dyn DynHandler>> {
        self.handlers.cached(category, InputType::of::<C>())
    }

    pub fn cache_len(&self) -> usize {
        self.handlers.resolved.len()
    }
}

pub struct QueryBus {
    handlers: HandlerCache,
    executor: TransactionalExecutor,
}

impl QueryBus {
    pub fn new(registry: Arc<HandlerRegistry>, manager: Arc<dyn TransactionManager>) -> Self {
        Self {
            handlers: HandlerCache::new(registry),
            executor: TransactionalExecutor::new(manager),
        }
    }

    /// Runs in a read-only transaction.
    pub async fn dispatch<Q: Query>(&self, query: Q) -> Result<Q::Output, CourierError> {
        let input_type = InputType::of::<Q>();
        let handler = self.handlers.resolve(HandlerCategory::Query, input_type)?;

        self.executor
            .execute(TxMode::ReadOnly, move |tx| {
                async move {
                    let output = handler.handle_dyn(Box::new(query), tx).await?;
                    output
                        .downcast::<Q::Output>()
                        .map(|boxed| *boxed)
                        .map_err(|_| CourierError::ResultTypeMismatch {
                            input_type: input_type.name(),
                            expected: std::any::type_name::<Q::Output>(),
                            actual: "unknown",
                        })
                }
                .boxed()
            })
            .await
    }

    pub fn cached_handler<Q: Query>(&self) -> Option<Arc<dyn DynHandler>> {
        self.handlers.cached(HandlerCategory::Query, InputType::of::<Q>())
    }

    pub fn cache_len(&self) -> usize {
        self.handlers.resolved.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::retry::DefaultRetryPolicy;
    use crate::cqrs::{CommandHandler, CommandWithResultHandler, QueryHandler};
    use crate::impls::{DeferredWrite, InMemoryTransaction, InMemoryTransactionManager};
    use crate::ports::{RecordingSleeper, Transaction};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    type Balances = Arc<Mutex<HashMap<String, i64>>>;

    #[derive(Clone)]
    struct Deposit {
        account: String,
        amount: i64,
    }
    impl Command for Deposit {}

    struct OpenAccount {
        account: String,
    }
    impl Command for OpenAccount {}

    struct Unregistered;
    impl Command for Unregistered {}

    struct GetBalance {
        account: String,
    }
    impl Query for GetBalance {
        type Output = Option<i64>;
    }

    struct DepositHandler {
        balances: Balances,
        conflicts_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CommandHandler<Deposit> for DepositHandler {
        async fn handle(&self, cmd: Deposit, tx: &mut dyn Transaction) -> Result<(), CourierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let balances = Arc::clone(&self.balances);
            InMemoryTransaction::join(tx)?.defer(DeferredWrite::unchecked(async move {
                *balances.lock().unwrap().entry(cmd.account).or_default() += cmd.amount;
            }))?;
            if cmd.amount < 0 {
                return Err(CourierError::Rejected("negative deposit".to_string()));
            }
            let left = self.conflicts_left.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts_left.store(left - 1, Ordering::SeqCst);
                return Err(CourierError::ConcurrencyConflict("stale version".to_string()));
            }
            Ok(())
        }
    }

    struct OpenAccountHandler {
        balances: Balances,
    }

    #[async_trait]
    impl CommandWithResultHandler<OpenAccount> for OpenAccountHandler {
        type Output = String;

        async fn handle(
            &self,
            cmd: OpenAccount,
            tx: &mut dyn Transaction,
        ) -> Result<String, CourierError> {
            let balances = Arc::clone(&self.balances);
            let account = cmd.account.clone();
            InMemoryTransaction::join(tx)?.defer(DeferredWrite::unchecked(async move {
                balances.lock().unwrap().insert(account, 0);
            }))?;
            Ok(cmd.account)
        }
    }

    struct BalanceHandler {
        balances: Balances,
    }

    #[async_trait]
    impl QueryHandler<GetBalance> for BalanceHandler {
        async fn handle(
            &self,
            query: GetBalance,
            _tx: &mut dyn Transaction,
        ) -> Result<Option<i64>, CourierError> {
            Ok(self.balances.lock().unwrap().get(&query.account).copied())
        }
    }

    struct Fixture {
        commands: CommandBus,
        queries: QueryBus,
        manager: Arc<InMemoryTransactionManager>,
        balances: Balances,
        deposit: Arc<DepositHandler>,
    }

    fn fixture(conflicts: u32) -> Fixture {
        let balances: Balances = Arc::default();
        let deposit = Arc::new(DepositHandler {
            balances: Arc::clone(&balances),
            conflicts_left: AtomicU32::new(conflicts),
            calls: AtomicU32::new(0),
        });
        let registry = Arc::new(
            HandlerRegistry::builder()
                .command::<Deposit, _>(SharedDeposit(Arc::clone(&deposit)))
                .command_with_result::<OpenAccount, _>(OpenAccountHandler {
                    balances: Arc::clone(&balances),
                })
                .query::<GetBalance, _>(BalanceHandler {
                    balances: Arc::clone(&balances),
                })
                .build()
                .unwrap(),
        );
        let manager = Arc::new(InMemoryTransactionManager::new());
        Fixture {
            commands: CommandBus::new(Arc::clone(&registry), manager.clone()),
            queries: QueryBus::new(registry, manager.clone()),
            manager,
            balances,
            deposit,
        }
    }

    // lets the test keep a handle on the registered handler's counters
    struct SharedDeposit(Arc<DepositHandler>);

    #[async_trait]
    impl CommandHandler<Deposit> for SharedDeposit {
        async fn handle(&self, cmd: Deposit, tx: &mut dyn Transaction) -> Result<(), CourierError> {
            self.0.handle(cmd, tx).await
        }
    }

    fn deposit(amount: i64) -> Deposit {
        Deposit {
            account: "A1".to_string(),
            amount,
        }
    }

    #[tokio::test]
    async fn dispatch_commits_handler_writes() {
        let f = fixture(0);

        f.commands.dispatch(deposit(50)).await.unwrap();

        assert_eq!(f.balances.lock().unwrap().get("A1"), Some(&50));
        assert_eq!(f.manager.stats().committed, 1);
    }

    #[tokio::test]
    async fn handler_failure_rolls_back_and_surfaces_unchanged() {
        let f = fixture(0);

        let err = f.commands.dispatch(deposit(-5)).await.unwrap_err();

        assert!(matches!(err, CourierError::Rejected(ref msg) if msg == "negative deposit"));
        assert!(f.balances.lock().unwrap().is_empty());
        assert_eq!(f.manager.stats().rolled_back, 1);
        assert_eq!(f.manager.stats().open(), 0);
    }

    #[tokio::test]
    async fn cold_and_warm_cache_resolve_the_same_handler() {
        let f = fixture(0);
        assert!(f.commands.cached_handler::<Deposit>(HandlerCategory::Command).is_none());

        f.commands.dispatch(deposit(1)).await.unwrap();
        let cold = f
            .commands
            .cached_handler::<Deposit>(HandlerCategory::Command)
            .unwrap();
        f.commands.dispatch(deposit(1)).await.unwrap();
        let warm = f
            .commands
            .cached_handler::<Deposit>(HandlerCategory::Command)
            .unwrap();

        assert!(Arc::ptr_eq(&cold, &warm));
        assert_eq!(f.commands.cache_len(), 1);
        assert_eq!(f.balances.lock().unwrap().get("A1"), Some(&2));
    }

    #[tokio::test]
    async fn unregistered_command_fails_without_opening_a_transaction() {
        let f = fixture(0);

        let err = f.commands.dispatch(Unregistered).await.unwrap_err();

        assert!(err.is_configuration());
        assert_eq!(f.manager.stats().begun, 0);
    }

    #[tokio::test]
    async fn dispatch_with_result_returns_handler_value() {
        let f = fixture(0);

        let id: String = f
            .commands
            .dispatch_with_result(OpenAccount {
                account: "A9".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(id, "A9");
        assert_eq!(f.balances.lock().unwrap().get("A9"), Some(&0));
    }

    #[tokio::test]
    async fn dispatch_with_wrong_result_type_is_rejected() {
        let f = fixture(0);

        let err = f
            .commands
            .dispatch_with_result::<OpenAccount, u64>(OpenAccount {
                account: "A9".to_string(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CourierError::ResultTypeMismatch { .. }));
        assert_eq!(f.manager.stats().begun, 0);
    }

    #[tokio::test]
    async fn query_is_read_only_and_repeatable() {
        let f = fixture(0);
        f.commands.dispatch(deposit(10)).await.unwrap();

        let first = f
            .queries
            .dispatch(GetBalance {
                account: "A1".to_string(),
            })
            .await
            .unwrap();
        let second = f
            .queries
            .dispatch(GetBalance {
                account: "A1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(first, Some(10));
        assert_eq!(first, second);
        assert_eq!(f.queries.cache_len(), 1);
        assert!(f.queries.cached_handler::<GetBalance>().is_some());
    }

    #[tokio::test]
    async fn retried_dispatch_recovers_from_conflicts() {
        let f = fixture(2);
        let sleeper = Arc::new(RecordingSleeper::new());
        let retrier = Retrier::with_sleeper(DefaultRetryPolicy::default(), sleeper.clone());

        f.commands
            .dispatch_retrying(&retrier, RetryOptions::default(), deposit(5))
            .await
            .unwrap();

        assert_eq!(f.deposit.calls.load(Ordering::SeqCst), 3);
        // the two conflicting attempts were rolled back
        assert_eq!(f.balances.lock().unwrap().get("A1"), Some(&5));
        assert_eq!(f.manager.stats().rolled_back, 2);
        assert_eq!(sleeper.recorded().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_dispatches_converge_on_one_cache_entry() {
        let f = Arc::new(fixture(0));

        let mut joins = Vec::new();
        for _ in 0..8 {
            let f = Arc::clone(&f);
            joins.push(tokio::spawn(async move {
                f.commands.dispatch(deposit(1)).await
            }));
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }

        assert_eq!(f.commands.cache_len(), 1);
        assert_eq!(f.balances.lock().unwrap().get("A1"), Some(&8));
    }
}
