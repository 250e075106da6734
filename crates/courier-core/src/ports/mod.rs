//! Ports - seams to the outside world.
//!
//! Each trait hides one external collaborator: time, id generation,
//! transaction demarcation, outbox persistence and the message transport.
//! In-memory implementations live in `impls`.

pub mod clock;
pub mod id_generator;
pub mod outbox_store;
pub mod transaction;
pub mod transport;

pub use self::clock::{Clock, FixedClock, RecordingSleeper, Sleeper, SystemClock, TokioSleeper};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::outbox_store::OutboxStore;
pub use self::transaction::{Transaction, TransactionManager, TxMode};
pub use self::transport::MessageTransport;
