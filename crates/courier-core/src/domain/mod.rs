//! Domain model (ids, errors, domain events, outbox records).

pub mod errors;
pub mod events;
pub mod ids;
pub mod outbox;

pub use self::errors::{CourierError, CourierResult, ErrorKind, HandlerCategory};
pub use self::events::{AggregateEvents, DomainEvent, EventMetadata};
pub use self::ids::{EventId, Id, IdMarker, TxId};
pub use self::outbox::{NewOutboxEvent, OutboxEvent, OutboxMessage, OutboxStatus};
