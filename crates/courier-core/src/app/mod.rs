//! App - wires the ports into dispatch and delivery.
//!
//! # Components
//! - **CommandBus / QueryBus**: resolve a handler and run it in a transaction
//! - **TransactionalExecutor**: begin / commit / rollback around a unit of work
//! - **Retrier**: bounded retries with backoff around any operation
//! - **OutboxEventPublisher**: domain events -> outbox rows, in the caller's transaction
//! - **OutboxPublisher**: outbox -> message transport
//! - **Projector**: published events -> read models

pub mod bus;
pub mod event_publisher;
pub mod projection;
pub mod publisher_loop;
pub mod retry;
pub mod status;
pub mod transactional;

pub use self::bus::{CommandBus, QueryBus};
pub use self::event_publisher::OutboxEventPublisher;
pub use self::projection::{ProjectionSink, ProjectionTable, Projector, ReadModelUpdater};
pub use self::publisher_loop::{OutboxPublisher, PublishReport};
pub use self::retry::{
    DefaultRetryPolicy, ExponentialBackoffPolicy, Retrier, RetryOptions, RetryPolicy,
};
pub use self::status::OutboxCounts;
pub use self::transactional::TransactionalExecutor;
