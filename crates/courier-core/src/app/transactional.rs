//! TransactionalExecutor - explicit transaction scope around a unit of work.
//!
//! Exactly one begin and one commit-or-rollback per `execute` call, on every
//! exit path. The work's own error is what the caller sees: a rollback that
//! fails as well is logged and does not replace it.

use futures::future::BoxFuture;
use std::sync::Arc;

use crate::domain::errors::CourierError;
use crate::ports::{Transaction, TransactionManager, TxMode};

#[derive(Clone)]
pub struct TransactionalExecutor {
    manager: Arc<dyn TransactionManager>,
}

impl TransactionalExecutor {
    pub fn new(manager: Arc<dyn TransactionManager>) -> Self {
        Self { manager }
    }

    /// Run `work` inside a fresh transaction.
    ///
    /// ```ignore
    /// executor
    ///     .execute(TxMode::ReadWrite, move |tx| {
    ///         async move { store.append(tx, event).await }.boxed()
    ///     })
    ///     .await?;
    /// ```
    pub async fn execute<T, F>(&self, mode: TxMode, work: F) -> Result<T, CourierError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut dyn Transaction) -> BoxFuture<'t, Result<T, CourierError>>
            + Send,
    {
        let mut tx = self.manager.begin(mode).await?;
        let tx_id = tx.id();

        match work(tx.as_mut()).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(%tx_id, error = %err, "unit of work failed, rolling back");
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(%tx_id, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}
