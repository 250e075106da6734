//! Command and Query marker traits.
//!
//! Routing is by exact runtime type: each concrete input type is identified
//! by its `TypeId`, so a wrapper or "subtype" of a registered command never
//! matches the registered handler.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Write intent. May have side effects, no result required.
///
/// ```ignore
/// struct Deposit { account_id: String, amount: i64 }
/// impl Command for Deposit {}
/// ```
pub trait Command: Send + 'static {}

/// Read intent. Pure, and declares the type it answers with.
///
/// ```ignore
/// struct GetBalance { account_id: String }
/// impl Query for GetBalance { type Output = i64; }
/// ```
pub trait Query: Send + 'static {
    type Output: Send + 'static;
}

/// Static identity of a concrete input (or output) type.
///
/// Equality and hashing use only the `TypeId`; the name is carried for error
/// messages and logs.
#[derive(Clone, Copy)]
pub struct InputType {
    id: TypeId,
    name: &'static str,
}

impl InputType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for InputType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for InputType {}

impl Hash for InputType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OpenAccount;
    struct OpenSavingsAccount(#[allow(dead_code)] OpenAccount);

    #[test]
    fn identity_is_exact_type_equality() {
        assert_eq!(InputType::of::<OpenAccount>(), InputType::of::<OpenAccount>());
        assert_ne!(
            InputType::of::<OpenAccount>(),
            InputType::of::<OpenSavingsAccount>()
        );
    }

    #[test]
    fn name_is_the_rust_type_name() {
        assert!(InputType::of::<OpenAccount>().name().ends_with("OpenAccount"));
    }
}
