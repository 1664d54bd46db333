//! Per-client validators and delivery hooks.
//!
//! A client registers one [`MessageValidator`] and optionally one
//! [`IncomingMessageHook`] per [`ClientKey`]. Registration happens before
//! the manager starts; afterwards the registry is shared read-only.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use courier_core::{ClientKey, Group, InvalidMessageError, Message, MessageContext, Metadata};
use courier_store::{StoreError, StoreTxn};

/// Checks a message's syntax and extracts its metadata and dependencies.
///
/// Must be pure: validators run on the blocking pool outside any
/// transaction and may run concurrently.
pub trait MessageValidator: Send + Sync + 'static {
    fn validate_message(
        &self,
        message: &Message,
        group: &Group,
    ) -> Result<MessageContext, InvalidMessageError>;
}

impl<F> MessageValidator for F
where
    F: Fn(&Message, &Group) -> Result<MessageContext, InvalidMessageError> + Send + Sync + 'static,
{
    fn validate_message(
        &self,
        message: &Message,
        group: &Group,
    ) -> Result<MessageContext, InvalidMessageError> {
        self(message, group)
    }
}

/// What to do with a message whose dependencies are all delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAction {
    /// Deliver and share it (and its dependencies) with contacts.
    AcceptShare,
    /// Deliver without sharing.
    AcceptDoNotShare,
    /// Leave it pending; it is offered to the hook again later.
    Defer,
    /// Invalidate it and everything that depends on it.
    Reject,
}

/// Why a hook did not return an action.
#[derive(Debug, Error)]
pub enum HookError {
    /// The hook rejected the message.
    #[error(transparent)]
    Invalid(#[from] InvalidMessageError),

    /// The hook's own storage work failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs inside the delivery transaction when a message is ready to deliver.
pub trait IncomingMessageHook: Send + Sync + 'static {
    fn incoming_message(
        &self,
        txn: &mut dyn StoreTxn,
        message: &Message,
        metadata: &Metadata,
    ) -> Result<DeliveryAction, HookError>;
}

impl<F> IncomingMessageHook for F
where
    F: Fn(&mut dyn StoreTxn, &Message, &Metadata) -> Result<DeliveryAction, HookError>
        + Send
        + Sync
        + 'static,
{
    fn incoming_message(
        &self,
        txn: &mut dyn StoreTxn,
        message: &Message,
        metadata: &Metadata,
    ) -> Result<DeliveryAction, HookError> {
        self(txn, message, metadata)
    }
}

/// Validators and hooks by client.
#[derive(Default, Clone)]
pub struct Registry {
    validators: HashMap<ClientKey, Arc<dyn MessageValidator>>,
    hooks: HashMap<ClientKey, Arc<dyn IncomingMessageHook>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validator, replacing any earlier one for `client`.
    pub fn register_validator(&mut self, client: ClientKey, validator: Arc<dyn MessageValidator>) {
        self.validators.insert(client, validator);
    }

    /// Register a hook, replacing any earlier one for `client`.
    pub fn register_hook(&mut self, client: ClientKey, hook: Arc<dyn IncomingMessageHook>) {
        self.hooks.insert(client, hook);
    }

    pub fn validator(&self, client: &ClientKey) -> Option<Arc<dyn MessageValidator>> {
        self.validators.get(client).cloned()
    }

    /// Every client with a validator or a hook, in key order.
    pub fn clients(&self) -> Vec<ClientKey> {
        let keys: BTreeSet<&ClientKey> = self.validators.keys().chain(self.hooks.keys()).collect();
        keys.into_iter().cloned().collect()
    }

    /// Offer a ready message to the client's hook. No hook means accept
    /// without sharing.
    pub fn deliver(
        &self,
        txn: &mut dyn StoreTxn,
        client: &ClientKey,
        message: &Message,
        metadata: &Metadata,
    ) -> DeliveryAction {
        let Some(hook) = self.hooks.get(client) else {
            return DeliveryAction::AcceptDoNotShare;
        };
        match hook.incoming_message(txn, message, metadata) {
            Ok(action) => action,
            Err(HookError::Invalid(e)) => {
                info!(
                    message = %message.id(),
                    client = %client,
                    reason = %e.reason,
                    "hook rejected message"
                );
                DeliveryAction::Reject
            }
            Err(HookError::Store(e)) => {
                info!(
                    message = %message.id(),
                    client = %client,
                    error = %e,
                    "hook failed, deferring"
                );
                DeliveryAction::Defer
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::ClientId;
    use courier_store::{MemoryStore, Store};

    fn key(name: &str) -> ClientKey {
        ClientKey::new(ClientId::new(name).unwrap(), 0)
    }

    fn message() -> Message {
        Message::new(courier_core::GroupId::from_bytes([3; 32]), 1, b"m").unwrap()
    }

    #[test]
    fn test_missing_hook_accepts_without_sharing() {
        let registry = Registry::new();
        let store = MemoryStore::new();
        let action = store
            .transaction_blocking(false, |txn| {
                Ok(registry.deliver(txn, &key("a"), &message(), &Metadata::new()))
            })
            .unwrap();
        assert_eq!(action, DeliveryAction::AcceptDoNotShare);
    }

    #[test]
    fn test_hook_errors_map_to_actions() {
        let mut registry = Registry::new();
        registry.register_hook(
            key("reject"),
            Arc::new(
                |_: &mut dyn StoreTxn,
                 _: &Message,
                 _: &Metadata|
                 -> Result<DeliveryAction, HookError> {
                    Err(InvalidMessageError::new("nope").into())
                },
            ),
        );
        registry.register_hook(
            key("defer"),
            Arc::new(
                |_: &mut dyn StoreTxn,
                 _: &Message,
                 _: &Metadata|
                 -> Result<DeliveryAction, HookError> {
                    Err(StoreError::ReadOnly.into())
                },
            ),
        );
        let store = MemoryStore::new();
        let (reject, defer) = store
            .transaction_blocking(false, |txn| {
                let m = message();
                let meta = Metadata::new();
                Ok((
                    registry.deliver(txn, &key("reject"), &m, &meta),
                    registry.deliver(txn, &key("defer"), &m, &meta),
                ))
            })
            .unwrap();
        assert_eq!(reject, DeliveryAction::Reject);
        assert_eq!(defer, DeliveryAction::Defer);
    }

    #[test]
    fn test_clients_lists_both_registrations_once() {
        let mut registry = Registry::new();
        registry.register_validator(
            key("b"),
            Arc::new(
                |_: &Message, _: &Group| -> Result<MessageContext, InvalidMessageError> {
                    Ok(MessageContext::default())
                },
            ),
        );
        registry.register_hook(
            key("b"),
            Arc::new(
                |_: &mut dyn StoreTxn,
                 _: &Message,
                 _: &Metadata|
                 -> Result<DeliveryAction, HookError> {
                    Ok(DeliveryAction::AcceptShare)
                },
            ),
        );
        registry.register_hook(
            key("a"),
            Arc::new(
                |_: &mut dyn StoreTxn,
                 _: &Message,
                 _: &Metadata|
                 -> Result<DeliveryAction, HookError> {
                    Ok(DeliveryAction::Defer)
                },
            ),
        );
        assert_eq!(registry.clients(), vec![key("a"), key("b")]);
        assert!(registry.validator(&key("b")).is_some());
        assert!(registry.validator(&key("a")).is_none());
    }
}
