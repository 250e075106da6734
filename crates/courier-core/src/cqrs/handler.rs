//! Handler traits and their type-erased form.
//!
//! Two layers:
//! - **typed**: `CommandHandler<C>`, `CommandWithResultHandler<C>`,
//!   `QueryHandler<Q>` - what application code implements
//! - **erased**: `DynHandler` - object safe, stored in the registry as
//!   `Arc<dyn DynHandler>` and keyed by the input's `TypeId`
//!
//! The adapters below turn the first into the second. Every handler receives
//! the dispatch's open transaction so its writes (including outbox appends)
//! join the same unit of work.

use async_trait::async_trait;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use super::message::{Command, InputType, Query};
use crate::domain::errors::{CourierError, HandlerCategory};
use crate::ports::Transaction;

pub type AnyBox = Box<dyn Any + Send>;

/// Fire-and-forget command handler.
///
/// ```ignore
/// struct DepositHandler { accounts: Arc<AccountRepository>, outbox: OutboxEventPublisher }
///
/// #[async_trait]
/// impl CommandHandler<Deposit> for DepositHandler {
///     async fn handle(&self, cmd: Deposit, tx: &mut dyn Transaction) -> Result<(), CourierError> {
///         let mut account = self.accounts.load(&cmd.account_id).await?;
///         account.deposit(cmd.amount)?;
///         self.accounts.save(tx, &mut account).await?;
///         self.outbox.publish_all(tx, account.take_events()).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn handle(&self, command: C, tx: &mut dyn Transaction) -> Result<(), CourierError>;
}

/// Command handler that hands a value back (e.g. the id of a created entity).
#[async_trait]
pub trait CommandWithResultHandler<C: Command>: Send + Sync {
    type Output: Send + 'static;

    async fn handle(
        &self,
        command: C,
        tx: &mut dyn Transaction,
    ) -> Result<Self::Output, CourierError>;
}

/// Query handler. `tx` is read-only.
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    async fn handle(&self, query: Q, tx: &mut dyn Transaction) -> Result<Q::Output, CourierError>;
}

/// Object-safe handler.
#[async_trait]
pub trait DynHandler: Send + Sync {
    fn category(&self) -> HandlerCategory;

    /// The single input type this handler accepts.
    fn input_type(&self) -> InputType;

    fn output_type(&self) -> InputType;

    fn supports(&self, input: &InputType) -> bool {
        self.input_type() == *input
    }

    async fn handle_dyn(
        &self,
        input: AnyBox,
        tx: &mut dyn Transaction,
    ) -> Result<AnyBox, CourierError>;
}

fn downcast_input<T: 'static>(input: AnyBox) -> Result<T, CourierError> {
    input.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
        CourierError::Other(format!(
            "handler for {} received a different input type",
            std::any::type_name::<T>()
        ))
    })
}

// `fn(C)` keeps the adapters Send + Sync without requiring `C: Sync`.
struct CommandAdapter<C, H> {
    handler: H,
    _marker: PhantomData<fn(C)>,
}

#[async_trait]
impl<C: Command, H: CommandHandler<C>> DynHandler for CommandAdapter<C, H> {
    fn category(&self) -> HandlerCategory {
        HandlerCategory::Command
    }

    fn input_type(&self) -> InputType {
        InputType::of::<C>()
    }

    fn output_type(&self) -> InputType {
        InputType::of::<()>()
    }

    async fn handle_dyn(
        &self,
        input: AnyBox,
        tx: &mut dyn Transaction,
    ) -> Result<AnyBox, CourierError> {
        let command = downcast_input::<C>(input)?;
        self.handler.handle(command, tx).await?;
        Ok(Box::new(()))
    }
}

struct CommandWithResultAdapter<C, H> {
    handler: H,
    _marker: PhantomData<fn(C)>,
}

#[async_trait]
impl<C: Command, H: CommandWithResultHandler<C>> DynHandler for CommandWithResultAdapter<C, H> {
    fn category(&self) -> HandlerCategory {
        HandlerCategory::CommandWithResult
    }

    fn input_type(&self) -> InputType {
        InputType::of::<C>()
    }

    fn output_type(&self) -> InputType {
        InputType::of::<H::Output>()
    }

    async fn handle_dyn(
        &self,
        input: AnyBox,
        tx: &mut dyn Transaction,
    ) -> Result<AnyBox, CourierError> {
        let command = downcast_input::<C>(input)?;
        let output = self.handler.handle(command, tx).await?;
        Ok(Box::new(output))
    }
}

struct QueryAdapter<Q, H> {
    handler: H,
    _marker: PhantomData<fn(Q)>,
}

#[async_trait]
impl<Q: Query, H: QueryHandler<Q>> DynHandler for QueryAdapter<Q, H> {
    fn category(&self) -> HandlerCategory {
        HandlerCategory::Query
    }

    fn input_type(&self) -> InputType {
        InputType::of::<Q>()
    }

    fn output_type(&self) -> InputType {
        InputType::of::<Q::Output>()
    }

    async fn handle_dyn(
        &self,
        input: AnyBox,
        tx: &mut dyn Transaction,
    ) -> Result<AnyBox, CourierError> {
        let query = downcast_input::<Q>(input)?;
        let output = self.handler.handle(query, tx).await?;
        Ok(Box::new(output))
    }
}

pub fn erase_command<C, H>(handler: H) -> Arc<dyn DynHandler>
where
    C: Command,
    H: CommandHandler<C> + 'static,
{
    Arc::new(CommandAdapter {
        handler,
        _marker: PhantomData,
    })
}

pub fn erase_command_with_result<C, H>(handler: H) -> Arc<dyn DynHandler>
where
    C: Command,
    H: CommandWithResultHandler<C> + 'static,
{
    Arc::new(CommandWithResultAdapter {
        handler,
        _marker: PhantomData,
    })
}

pub fn erase_query<Q, H>(handler: H) -> Arc<dyn DynHandler>
where
    Q: Query,
    H: QueryHandler<Q> + 'static,
{
    Arc::new(QueryAdapter {
        handler,
        _marker: PhantomData,
    })
}
