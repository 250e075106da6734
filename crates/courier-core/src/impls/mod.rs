//! In-memory port implementations, for tests and the demo.

pub mod memory_outbox;
pub mod memory_transport;
pub mod memory_tx;

pub use self::memory_outbox::InMemoryOutboxStore;
pub use self::memory_transport::{InMemoryTransport, SentMessage};
pub use self::memory_tx::{DeferredWrite, InMemoryTransaction, InMemoryTransactionManager, TxStats};
