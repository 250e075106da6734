use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, sleep};
use tracing_subscriber::EnvFilter;

use courier_core::app::{
    CommandBus, OutboxEventPublisher, OutboxPublisher, ProjectionTable, Projector, QueryBus,
    ReadModelUpdater, Retrier, RetryOptions,
};
use courier_core::config::CourierConfig;
use courier_core::cqrs::{
    Command, CommandHandler, CommandWithResultHandler, HandlerRegistry, Query, QueryHandler,
};
use courier_core::domain::{
    AggregateEvents, CourierError, DomainEvent, EventMetadata, OutboxEvent,
};
use courier_core::impls::{
    DeferredWrite, InMemoryOutboxStore, InMemoryTransaction, InMemoryTransactionManager,
    InMemoryTransport,
};
use courier_core::ports::{OutboxStore, Transaction};

// ---- domain -------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum AccountEvent {
    AccountOpened {
        #[serde(flatten)]
        meta: EventMetadata,
        account_id: String,
        owner: String,
    },
    MoneyDeposited {
        #[serde(flatten)]
        meta: EventMetadata,
        account_id: String,
        amount: i64,
        balance: i64,
    },
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &str {
        match self {
            AccountEvent::AccountOpened { .. } => "AccountOpened",
            AccountEvent::MoneyDeposited { .. } => "MoneyDeposited",
        }
    }

    fn aggregate_type(&self) -> &str {
        "Account"
    }

    fn aggregate_id(&self) -> String {
        match self {
            AccountEvent::AccountOpened { account_id, .. }
            | AccountEvent::MoneyDeposited { account_id, .. } => account_id.clone(),
        }
    }

    fn metadata(&self) -> &EventMetadata {
        match self {
            AccountEvent::AccountOpened { meta, .. }
            | AccountEvent::MoneyDeposited { meta, .. } => meta,
        }
    }
}

#[derive(Debug, Clone)]
struct Account {
    id: String,
    balance: i64,
    version: u64,
    events: AggregateEvents<AccountEvent>,
}

impl Account {
    fn open(id: String, owner: String) -> Self {
        let mut account = Self {
            id: id.clone(),
            balance: 0,
            version: 0,
            events: AggregateEvents::new(),
        };
        account.events.record(AccountEvent::AccountOpened {
            meta: EventMetadata::now(),
            account_id: id,
            owner,
        });
        account
    }

    fn deposit(&mut self, amount: i64) -> Result<(), CourierError> {
        if amount <= 0 {
            return Err(CourierError::Rejected(format!(
                "deposit must be positive, got {amount}"
            )));
        }
        self.balance += amount;
        self.events.record(AccountEvent::MoneyDeposited {
            meta: EventMetadata::now(),
            account_id: self.id.clone(),
            amount,
            balance: self.balance,
        });
        Ok(())
    }
}

/// Versioned account rows; writes join the dispatch transaction.
#[derive(Default)]
struct AccountRepository {
    rows: Arc<Mutex<HashMap<String, (i64, u64)>>>,
}

impl AccountRepository {
    async fn load(&self, id: &str) -> Result<Account, CourierError> {
        let rows = self.rows.lock().await;
        let (balance, version) = rows
            .get(id)
            .copied()
            .ok_or_else(|| CourierError::Rejected(format!("account {id} does not exist")))?;
        Ok(Account {
            id: id.to_string(),
            balance,
            version,
            events: AggregateEvents::new(),
        })
    }

    async fn balance(&self, id: &str) -> Option<i64> {
        self.rows.lock().await.get(id).map(|(balance, _)| *balance)
    }

    /// Optimistic save: the stored version must still be the one loaded.
    fn save(&self, tx: &mut dyn Transaction, account: &Account) -> Result<(), CourierError> {
        let (balance, expected) = (account.balance, account.version);
        let check = {
            let rows = Arc::clone(&self.rows);
            let id = account.id.clone();
            async move {
                let current = rows.lock().await.get(&id).map(|(_, v)| *v).unwrap_or(0);
                if current != expected {
                    return Err(CourierError::ConcurrencyConflict(format!(
                        "account {id}: expected version {expected}, found {current}"
                    )));
                }
                Ok(())
            }
        };
        let rows = Arc::clone(&self.rows);
        let id = account.id.clone();
        InMemoryTransaction::join(tx)?.defer(DeferredWrite::new(check, async move {
            rows.lock().await.insert(id, (balance, expected + 1));
        }))
    }
}

// ---- commands / queries -------------------------------------------------

struct OpenAccount {
    account_id: String,
    owner: String,
}
impl Command for OpenAccount {}

#[derive(Clone)]
struct Deposit {
    account_id: String,
    amount: i64,
}
impl Command for Deposit {}

struct GetBalance {
    account_id: String,
}
impl Query for GetBalance {
    type Output = Option<i64>;
}

struct OpenAccountHandler {
    accounts: Arc<AccountRepository>,
    outbox: OutboxEventPublisher,
}

#[async_trait]
impl CommandWithResultHandler<OpenAccount> for OpenAccountHandler {
    type Output = String;

    async fn handle(
        &self,
        cmd: OpenAccount,
        tx: &mut dyn Transaction,
    ) -> Result<String, CourierError> {
        let mut account = Account::open(cmd.account_id, cmd.owner);
        self.accounts.save(tx, &account)?;
        self.outbox.publish_all(tx, account.events.take()).await?;
        Ok(account.id)
    }
}

struct DepositHandler {
    accounts: Arc<AccountRepository>,
    outbox: OutboxEventPublisher,
}

#[async_trait]
impl CommandHandler<Deposit> for DepositHandler {
    async fn handle(&self, cmd: Deposit, tx: &mut dyn Transaction) -> Result<(), CourierError> {
        let mut account = self.accounts.load(&cmd.account_id).await?;
        account.deposit(cmd.amount)?;
        // let concurrent deposits interleave so some of them conflict
        tokio::task::yield_now().await;
        self.accounts.save(tx, &account)?;
        self.outbox.publish_all(tx, account.events.take()).await?;
        Ok(())
    }
}

struct GetBalanceHandler {
    accounts: Arc<AccountRepository>,
}

#[async_trait]
impl QueryHandler<GetBalance> for GetBalanceHandler {
    async fn handle(
        &self,
        query: GetBalance,
        _tx: &mut dyn Transaction,
    ) -> Result<Option<i64>, CourierError> {
        Ok(self.accounts.balance(&query.account_id).await)
    }
}

// ---- read model ---------------------------------------------------------

/// Balance view rebuilt from published `MoneyDeposited` events.
#[derive(Default)]
struct BalanceView {
    balances: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl ReadModelUpdater for BalanceView {
    fn event_type(&self) -> &str {
        "MoneyDeposited"
    }

    async fn update(&self, event: &OutboxEvent) -> Result<(), CourierError> {
        let payload: serde_json::Value = serde_json::from_str(&event.payload)?;
        let balance = payload["balance"]
            .as_i64()
            .ok_or_else(|| CourierError::Other("MoneyDeposited without balance".to_string()))?;
        let mut balances = self.balances.lock().await;
        let entry = balances.entry(event.aggregate_id.clone()).or_default();
        // at-least-once delivery: never move the view backwards
        *entry = (*entry).max(balance);
        Ok(())
    }
}

// ---- wiring -------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_core=debug")),
        )
        .init();

    let config = CourierConfig::from_env()?;

    // (A) ports
    let manager = Arc::new(InMemoryTransactionManager::new());
    let store =
        Arc::new(InMemoryOutboxStore::new().with_claim_timeout(config.outbox.claim_timeout()));
    let transport = Arc::new(InMemoryTransport::new());
    let accounts = Arc::new(AccountRepository::default());
    let outbox = OutboxEventPublisher::new(store.clone());

    // (B) handlers, checked once at startup
    let registry = Arc::new(
        HandlerRegistry::builder()
            .command_with_result::<OpenAccount, _>(OpenAccountHandler {
                accounts: accounts.clone(),
                outbox: outbox.clone(),
            })
            .command::<Deposit, _>(DepositHandler {
                accounts: accounts.clone(),
                outbox: outbox.clone(),
            })
            .query::<GetBalance, _>(GetBalanceHandler {
                accounts: accounts.clone(),
            })
            .expect_command_with_result::<OpenAccount>()
            .expect_command::<Deposit>()
            .expect_query::<GetBalance>()
            .build()?,
    );
    let commands = Arc::new(CommandBus::new(registry.clone(), manager.clone()));
    let queries = QueryBus::new(registry, manager.clone());
    let retrier = Arc::new(Retrier::new(config.retry.policy()));

    // (C) projection + publisher in the background
    let view = Arc::new(BalanceView::default());
    let projector = Projector::spawn(
        config.projection.workers,
        config.projection.queue_capacity,
        Arc::new(ProjectionTable::new().subscribe(view.clone())),
    );
    let publisher = Arc::new(
        OutboxPublisher::new(store.clone(), transport.clone(), config.outbox.clone())
            .with_projection(projector.sink()),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publisher_task = {
        let publisher = publisher.clone();
        tokio::spawn(async move { publisher.run(shutdown_rx).await })
    };

    // (D) commands
    let account_id: String = commands
        .dispatch_with_result(OpenAccount {
            account_id: "acc-1".to_string(),
            owner: "kim".to_string(),
        })
        .await?;

    let mut deposits = Vec::new();
    for amount in 1..=10 {
        let commands = commands.clone();
        let retrier = retrier.clone();
        let cmd = Deposit {
            account_id: account_id.clone(),
            amount,
        };
        deposits.push(tokio::spawn(async move {
            // conflicts are expected here; give them room
            commands
                .dispatch_retrying(retrier.as_ref(), RetryOptions::new(20, 0), cmd)
                .await
        }));
    }
    for deposit in deposits {
        if let Err(err) = deposit.await? {
            tracing::warn!(error = %err, "deposit gave up");
        }
    }

    if let Err(err) = commands
        .dispatch(Deposit {
            account_id: account_id.clone(),
            amount: -5,
        })
        .await
    {
        tracing::info!(error = %err, "rejected deposit rolled back");
    }

    // (E) query
    let balance = queries
        .dispatch(GetBalance {
            account_id: account_id.clone(),
        })
        .await?;
    println!("balance of {account_id}: {balance:?}");

    // (F) wait for the outbox to drain, then stop
    let max_retries = config.outbox.max_retries;
    for _ in 0..100 {
        let counts = store.counts_by_status(max_retries).await?;
        if counts.pending + counts.in_flight == 0 {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    let _ = shutdown_tx.send(true);
    publisher_task.await?;
    println!(
        "projected: {} applied, {} failed",
        projector.applied(),
        projector.failed()
    );
    projector.shutdown_and_join().await;

    let counts = store.counts_by_status(max_retries).await?;
    println!("outbox: {}", serde_json::to_string(&counts)?);
    println!("messages sent: {}", transport.sent().len());
    println!(
        "read model balance: {:?}",
        view.balances.lock().await.get(&account_id)
    );

    Ok(())
}
