//! Transaction port.
//!
//! A `Transaction` is an explicit handle on one unit of work. The buses open
//! exactly one per dispatch and always close it, committing on success and
//! rolling back on failure. Stores that need to take part in the unit of work
//! (the outbox, a repository) downcast the handle to their own concrete type
//! through `as_any_mut`, the same way a SQL store would reach the connection
//! behind it.

use async_trait::async_trait;
use std::any::Any;

use crate::domain::errors::CourierError;
use crate::domain::ids::TxId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxMode {
    ReadWrite,
    /// Writes are refused; implementations may skip write locks entirely.
    ReadOnly,
}

impl TxMode {
    pub fn is_read_only(self) -> bool {
        matches!(self, TxMode::ReadOnly)
    }
}

#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn Transaction>, CourierError>;
}

#[async_trait]
pub trait Transaction: Send {
    fn id(&self) -> TxId;

    fn mode(&self) -> TxMode;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    async fn commit(self: Box<Self>) -> Result<(), CourierError>;

    async fn rollback(self: Box<Self>) -> Result<(), CourierError>;
}
