//! Error taxonomy shared by the buses, the retry interceptor and the outbox.
//!
//! # Where each error comes from
//!
//! | raised by            | variants                                                    |
//! |----------------------|-------------------------------------------------------------|
//! | handler resolution   | `NoHandlerFound`, `AmbiguousHandler`, `ResultTypeMismatch`  |
//! | handlers             | `Rejected`, `ConcurrencyConflict`                           |
//! | transaction manager  | `Transaction`, `ReadOnlyTransaction`                        |
//! | outbox store         | `Storage`, `EventNotFound`, `DuplicateEvent`, `InvalidTransition` |
//! | message transport    | `Transport`                                                 |
//! | event serialization  | `Serialization`                                             |
//! | cancellable retry    | `Cancelled`                                                 |
//!
//! # How they are treated
//! - Resolution errors are raised before any transaction is opened. They mean
//!   the application is wired wrong, and no retry policy treats them as
//!   retryable.
//! - `ConcurrencyConflict` is the one `Transient` kind. The default retry
//!   policy retries it and nothing else. It can come from a handler or from a
//!   version check at commit; the in-memory transaction returns a failing
//!   check's error unchanged so both look the same to the caller.
//! - Errors inside a dispatch roll the transaction back and reach the caller
//!   as they were raised. Retrying never wraps them either.
//! - The outbox publisher never returns per-event errors. It records send
//!   failures on the event (`mark_failed`) and logs store errors.

use thiserror::Error;

use super::ids::EventId;
use super::outbox::OutboxStatus;

/// Operational classification of a failure.
///
/// - `Transient`: may succeed if simply tried again (optimistic conflicts)
/// - `Permanent`: retrying cannot help (business rejection, bad wiring)
/// - `Infrastructure`: storage / transaction / transport trouble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Which bus a handler belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerCategory {
    Command,
    CommandWithResult,
    Query,
}

impl std::fmt::Display for HandlerCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HandlerCategory::Command => "command",
            HandlerCategory::CommandWithResult => "command-with-result",
            HandlerCategory::Query => "query",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("no {category} handler found for {input_type}")]
    NoHandlerFound {
        category: HandlerCategory,
        input_type: &'static str,
    },

    #[error("{count} {category} handlers registered for {input_type}")]
    AmbiguousHandler {
        category: HandlerCategory,
        input_type: &'static str,
        count: usize,
    },

    #[error("handler for {input_type} returns {actual}, caller expected {expected}")]
    ResultTypeMismatch {
        input_type: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    /// A concurrent writer changed the record since it was read.
    #[error("optimistic concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Business rule violation raised by a handler.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("write attempted inside a read-only transaction")]
    ReadOnlyTransaction,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("outbox event {0} not found")]
    EventNotFound(EventId),

    #[error("outbox event {0} already exists")]
    DuplicateEvent(EventId),

    #[error("outbox event {event_id} cannot move from {from} to {to}")]
    InvalidTransition {
        event_id: EventId,
        from: OutboxStatus,
        to: OutboxStatus,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl CourierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CourierError::ConcurrencyConflict(_) => ErrorKind::Transient,
            CourierError::Transaction(_)
            | CourierError::Storage(_)
            | CourierError::Transport(_) => ErrorKind::Infrastructure,
            _ => ErrorKind::Permanent,
        }
    }

    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, CourierError::ConcurrencyConflict(_))
    }

    /// Wiring errors are fatal and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CourierError::NoHandlerFound { .. }
                | CourierError::AmbiguousHandler { .. }
                | CourierError::ResultTypeMismatch { .. }
        )
    }
}

pub type CourierResult<T> = Result<T, CourierError>;
