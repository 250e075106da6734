//! courier-core
//!
//! Command/query dispatch with a transactional outbox.
//!
//! # Modules
//! - **domain**: ids, errors, domain events, outbox records and their state machine
//! - **ports**: clock/sleep, id generation, transactions, outbox store, message transport
//! - **cqrs**: Command/Query markers, handler traits, the handler registry
//! - **app**: command/query buses, retry, outbox publishing, read-model projection
//! - **impls**: in-memory port implementations (tests, demo)
//! - **config**: runtime settings loaded from the environment
//!
//! # Flow
//! ```text
//! CommandBus::dispatch ─► handler (tx) ─► state change + OutboxEventPublisher::publish
//!                                            │ commit (same tx)
//!                                            ▼
//!                     OutboxPublisher::run_once ─► MessageTransport::send ─► Projector
//! ```

pub mod app;
pub mod config;
pub mod cqrs;
pub mod domain;
pub mod impls;
pub mod ports;

pub use crate::config::{ConfigError, CourierConfig};
pub use crate::domain::errors::{CourierError, CourierResult};
