//! CQRS core: message markers, handler traits and the handler registry.

pub mod handler;
pub mod message;
pub mod registry;

pub use self::handler::{
    AnyBox, CommandHandler, CommandWithResultHandler, DynHandler, QueryHandler, erase_command,
    erase_command_with_result, erase_query,
};
pub use self::message::{Command, InputType, Query};
pub use self::registry::{Ambiguity, HandlerRegistry, RegistryBuilder, RegistryError};
