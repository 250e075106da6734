//! HandlerRegistry - one handler per (category, input type), fixed at startup.
//!
//! The registry is assembled by `RegistryBuilder` and validated in `build()`:
//! - two handlers for the same input type in the same category -> `Ambiguous`
//! - an input type declared with `expect_*` but never registered -> `Missing`
//!
//! Both are wiring mistakes, so they surface at composition time rather than
//! on first dispatch. After `build()` the registry is immutable and can be
//! shared across threads without locking.

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{
    CommandHandler, CommandWithResultHandler, DynHandler, QueryHandler, erase_command,
    erase_command_with_result, erase_query,
};
use super::message::{Command, InputType, Query};
use crate::domain::errors::{CourierError, HandlerCategory};

/// One input type claimed by several handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ambiguity {
    pub category: HandlerCategory,
    pub input_type: InputType,
    pub count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("ambiguous handlers: {0:?}")]
    Ambiguous(Vec<Ambiguity>),

    #[error("missing handlers: {0:?}. These inputs were expected but not registered.")]
    Missing(Vec<(HandlerCategory, InputType)>),
}

impl From<RegistryError> for CourierError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Ambiguous(found) => match found.first() {
                Some(first) => CourierError::AmbiguousHandler {
                    category: first.category,
                    input_type: first.input_type.name(),
                    count: first.count,
                },
                None => CourierError::Other("ambiguous handlers".to_string()),
            },
            RegistryError::Missing(missing) => match missing.first() {
                Some((category, input_type)) => CourierError::NoHandlerFound {
                    category: *category,
                    input_type: input_type.name(),
                },
                None => CourierError::Other("missing handlers".to_string()),
            },
        }
    }
}

type RegistryKey = (HandlerCategory, InputType);

pub struct HandlerRegistry {
    handlers: HashMap<RegistryKey, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Exact-type lookup.
    pub fn resolve(
        &self,
        category: HandlerCategory,
        input_type: InputType,
    ) -> Result<Arc<dyn DynHandler>, CourierError> {
        self.handlers
            .get(&(category, input_type))
            .cloned()
            .ok_or(CourierError::NoHandlerFound {
                category,
                input_type: input_type.name(),
            })
    }

    pub fn registered_types(&self, category: HandlerCategory) -> Vec<InputType> {
        self.handlers
            .keys()
            .filter(|(c, _)| *c == category)
            .map(|(_, input)| *input)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Collects handlers, then validates them all at once.
///
/// ```ignore
/// let registry = HandlerRegistry::builder()
///     .command::<Deposit, _>(DepositHandler::new(..))
///     .command_with_result::<OpenAccount, _>(OpenAccountHandler::new(..))
///     .query::<GetBalance, _>(GetBalanceHandler::new(..))
///     .expect_query::<GetBalance>()
///     .build()?;
/// ```
#[derive(Default)]
pub struct RegistryBuilder {
    registrations: Vec<Arc<dyn DynHandler>>,
    expected: Vec<RegistryKey>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command<C, H>(self, handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        self.handler(erase_command::<C, H>(handler))
    }

    pub fn command_with_result<C, H>(self, handler: H) -> Self
    where
        C: Command,
        H: CommandWithResultHandler<C> + 'static,
    {
        self.handler(erase_command_with_result::<C, H>(handler))
    }

    pub fn query<Q, H>(self, handler: H) -> Self
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        self.handler(erase_query::<Q, H>(handler))
    }

    /// Add an already-erased handler.
    pub fn handler(mut self, handler: Arc<dyn DynHandler>) -> Self {
        self.registrations.push(handler);
        self
    }

    /// Add a whole collection of erased handlers.
    pub fn handlers(mut self, handlers: impl IntoIterator<Item = Arc<dyn DynHandler>>) -> Self {
        self.registrations.extend(handlers);
        self
    }

    pub fn expect_command<C: Command>(mut self) -> Self {
        self.expected
            .push((HandlerCategory::Command, InputType::of::<C>()));
        self
    }

    pub fn expect_command_with_result<C: Command>(mut self) -> Self {
        self.expected
            .push((HandlerCategory::CommandWithResult, InputType::of::<C>()));
        self
    }

    pub fn expect_query<Q: Query>(mut self) -> Self {
        self.expected
            .push((HandlerCategory::Query, InputType::of::<Q>()));
        self
    }

    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        let mut grouped: HashMap<RegistryKey, Vec<Arc<dyn DynHandler>>> = HashMap::new();
        let mut order: Vec<RegistryKey> = Vec::new();
        for handler in self.registrations {
            let key = (handler.category(), handler.input_type());
            let entry = grouped.entry(key).or_default();
            if entry.is_empty() {
                order.push(key);
            }
            entry.push(handler);
        }

        let ambiguous: Vec<Ambiguity> = order
            .iter()
            .filter_map(|key| {
                let count = grouped.get(key).map(Vec::len).unwrap_or(0);
                (count > 1).then_some(Ambiguity {
                    category: key.0,
                    input_type: key.1,
                    count,
                })
            })
            .collect();
        if !ambiguous.is_empty() {
            return Err(RegistryError::Ambiguous(ambiguous));
        }

        let missing: Vec<RegistryKey> = self
            .expected
            .into_iter()
            .filter(|key| !grouped.contains_key(key))
            .collect();
        if !missing.is_empty() {
            return Err(RegistryError::Missing(missing));
        }

        let handlers: HashMap<RegistryKey, Arc<dyn DynHandler>> = grouped
            .into_iter()
            .filter_map(|(key, mut list)| list.pop().map(|handler| (key, handler)))
            .collect();

        tracing::debug!(handlers = handlers.len(), "handler registry built");
        Ok(HandlerRegistry { handlers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Transaction;
    use async_trait::async_trait;

    struct Deposit;
    impl Command for Deposit {}

    struct Withdraw;
    impl Command for Withdraw {}

    struct GetBalance;
    impl Query for GetBalance {
        type Output = i64;
    }

    struct DepositHandler;

    #[async_trait]
    impl CommandHandler<Deposit> for DepositHandler {
        async fn handle(&self, _: Deposit, _: &mut dyn Transaction) -> Result<(), CourierError> {
            Ok(())
        }
    }

    struct BalanceHandler;

    #[async_trait]
    impl QueryHandler<GetBalance> for BalanceHandler {
        async fn handle(
            &self,
            _: GetBalance,
            _: &mut dyn Transaction,
        ) -> Result<i64, CourierError> {
            Ok(0)
        }
    }

    #[test]
    fn register_and_resolve() {
        let registry = HandlerRegistry::builder()
            .command::<Deposit, _>(DepositHandler)
            .query::<GetBalance, _>(BalanceHandler)
            .build()
            .unwrap();

        let handler = registry
            .resolve(HandlerCategory::Command, InputType::of::<Deposit>())
            .unwrap();
        assert!(handler.supports(&InputType::of::<Deposit>()));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_registration_fails_at_build() {
        let result = HandlerRegistry::builder()
            .command::<Deposit, _>(DepositHandler)
            .command::<Deposit, _>(DepositHandler)
            .build();

        match result {
            Err(RegistryError::Ambiguous(found)) => {
                assert_eq!(found.len(), 1);
                assert_eq!(found[0].input_type, InputType::of::<Deposit>());
                assert_eq!(found[0].count, 2);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("duplicate handlers must not build"),
        }
    }

    #[test]
    fn same_input_in_different_categories_is_not_ambiguous() {
        struct DepositWithReceipt;

        #[async_trait]
        impl CommandWithResultHandler<Deposit> for DepositWithReceipt {
            type Output = String;
            async fn handle(
                &self,
                _: Deposit,
                _: &mut dyn Transaction,
            ) -> Result<String, CourierError> {
                Ok("receipt".to_string())
            }
        }

        let registry = HandlerRegistry::builder()
            .command::<Deposit, _>(DepositHandler)
            .command_with_result::<Deposit, _>(DepositWithReceipt)
            .build();
        assert!(registry.is_ok());
    }

    #[test]
    fn unknown_input_is_no_handler_found() {
        let registry = HandlerRegistry::builder()
            .command::<Deposit, _>(DepositHandler)
            .build()
            .unwrap();

        let err = registry
            .resolve(HandlerCategory::Command, InputType::of::<Withdraw>())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CourierError::NoHandlerFound {
                category: HandlerCategory::Command,
                ..
            }
        ));
    }

    #[test]
    fn expected_but_missing_handlers_fail_build() {
        let result = HandlerRegistry::builder()
            .command::<Deposit, _>(DepositHandler)
            .expect_command::<Deposit>()
            .expect_command::<Withdraw>()
            .build();

        assert!(matches!(
            result,
            Err(RegistryError::Missing(missing))
                if missing == vec![(HandlerCategory::Command, InputType::of::<Withdraw>())]
        ));
    }

    #[test]
    fn registered_types_are_listed_per_category() {
        let registry = HandlerRegistry::builder()
            .command::<Deposit, _>(DepositHandler)
            .query::<GetBalance, _>(BalanceHandler)
            .build()
            .unwrap();

        assert_eq!(
            registry.registered_types(HandlerCategory::Query),
            vec![InputType::of::<GetBalance>()]
        );
        assert!(registry.registered_types(HandlerCategory::CommandWithResult).is_empty());
    }

    #[test]
    fn registry_error_converts_to_courier_error() {
        let err: CourierError = RegistryError::Ambiguous(vec![Ambiguity {
            category: HandlerCategory::Command,
            input_type: InputType::of::<Deposit>(),
            count: 2,
        }])
        .into();
        assert!(matches!(err, CourierError::AmbiguousHandler { count: 2, .. }));
    }
}
