//! The delivery state machine.
//!
//! Every step runs in its own write transaction and re-reads the state it
//! acts on, so a node that was settled by an earlier step is a no-op. Work
//! that fans out (invalidating dependents, re-checking pending dependents,
//! sharing dependencies) goes onto FIFO worklists which are drained one id
//! per transaction. State changes are announced after commit.
//!
//! All methods block and are meant to run on the blocking pool.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use courier_core::{ClientKey, Group, Message, MessageContext, MessageId, MessageState, Metadata};
use courier_store::{Event, EventBus, Result as StoreResult, Store, StoreTxn};

use crate::registry::{DeliveryAction, Registry};

/// Ids waiting for each kind of follow-up step.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Worklists {
    pub invalidate: VecDeque<MessageId>,
    pub pending: VecDeque<MessageId>,
    pub share: VecDeque<MessageId>,
}

impl Worklists {
    pub fn is_empty(&self) -> bool {
        self.invalidate.is_empty() && self.pending.is_empty() && self.share.is_empty()
    }

    fn append(&mut self, mut other: Worklists) {
        self.invalidate.append(&mut other.invalidate);
        self.pending.append(&mut other.pending);
        self.share.append(&mut other.share);
    }

    /// Next id to process. Invalidations go first so that a pending
    /// re-check never delivers a message about to be invalidated.
    fn pop(&mut self) -> Option<(Step, MessageId)> {
        if let Some(id) = self.invalidate.pop_front() {
            return Some((Step::Invalidate, id));
        }
        if let Some(id) = self.pending.pop_front() {
            return Some((Step::Deliver, id));
        }
        self.share.pop_front().map(|id| (Step::Share, id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Invalidate,
    Deliver,
    Share,
}

/// Changes made inside one transaction.
#[derive(Default)]
struct Changes {
    events: Vec<Event>,
    follow_up: Worklists,
}

impl Changes {
    fn set_state(
        &mut self,
        txn: &mut dyn StoreTxn,
        id: MessageId,
        state: MessageState,
    ) -> StoreResult<()> {
        if txn.get_message_state(&id)? == state {
            return Ok(());
        }
        txn.set_message_state(&id, state)?;
        self.events.push(Event::MessageStateChanged { id, state });
        Ok(())
    }

    fn invalidate(&mut self, txn: &mut dyn StoreTxn, id: MessageId) -> StoreResult<()> {
        if txn.get_message_state(&id)? == MessageState::Invalid {
            return Ok(());
        }
        self.set_state(txn, id, MessageState::Invalid)?;
        txn.delete_message(&id)?;
        txn.delete_message_metadata(&id)?;
        for (dependent, state) in txn.get_message_dependents(&id)? {
            if state != MessageState::Invalid {
                self.follow_up.invalidate.push_back(dependent);
            }
        }
        Ok(())
    }

    fn queue_pending_dependents(
        &mut self,
        txn: &mut dyn StoreTxn,
        id: &MessageId,
    ) -> StoreResult<()> {
        for (dependent, state) in txn.get_message_dependents(id)? {
            if state == MessageState::Pending {
                self.follow_up.pending.push_back(dependent);
            }
        }
        Ok(())
    }

    fn share(&mut self, txn: &mut dyn StoreTxn, id: MessageId) -> StoreResult<()> {
        txn.set_message_shared(&id)?;
        self.events.push(Event::MessageShared { id });
        Ok(())
    }
}

/// Summary of a set of dependency states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    AnyInvalid,
    Waiting,
    AllDelivered,
}

fn readiness(states: &BTreeMap<MessageId, MessageState>) -> Readiness {
    if states.values().any(|s| *s == MessageState::Invalid) {
        Readiness::AnyInvalid
    } else if states.values().all(|s| *s == MessageState::Delivered) {
        Readiness::AllDelivered
    } else {
        Readiness::Waiting
    }
}

/// Runs validation outcomes and worklists against a store.
#[derive(Clone)]
pub struct DeliveryEngine<S> {
    store: S,
    registry: Arc<Registry>,
    events: EventBus,
}

impl<S: Store> DeliveryEngine<S> {
    pub fn new(store: S, registry: Arc<Registry>, events: EventBus) -> Self {
        Self {
            store,
            registry,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Load a message awaiting validation with its group. `None` when the
    /// message vanished, was already validated, or its group is gone.
    pub fn load(&self, id: &MessageId) -> StoreResult<Option<(Message, Group)>> {
        let result = self.store.transaction_blocking(true, |txn| {
            if txn.get_message_state(id)? != MessageState::Unknown {
                return Ok(None);
            }
            let message = txn.get_message(id)?;
            let group = txn.get_group(&message.group_id())?;
            Ok(Some((message, group)))
        });
        match result {
            Err(e) if e.is_missing() => {
                info!(message = %id, error = %e, "message or group removed before validation");
                Ok(None)
            }
            other => other,
        }
    }

    /// Ids awaiting validation in the client's groups.
    pub fn messages_to_validate(&self, client: &ClientKey) -> StoreResult<Vec<MessageId>> {
        self.store
            .transaction_blocking(true, |txn| txn.get_messages_to_validate(client))
    }

    /// Re-check every pending message of the client.
    pub fn deliver_outstanding(&self, client: &ClientKey) -> StoreResult<()> {
        let pending = self
            .store
            .transaction_blocking(true, |txn| txn.get_pending_messages(client))?;
        debug!(client = %client, count = pending.len(), "delivering outstanding messages");
        self.drain(Worklists {
            pending: pending.into(),
            ..Worklists::default()
        })
    }

    /// Share delivered messages that shared messages depend on.
    pub fn share_outstanding(&self, client: &ClientKey) -> StoreResult<()> {
        let share = self
            .store
            .transaction_blocking(true, |txn| txn.get_messages_to_share(client))?;
        debug!(client = %client, count = share.len(), "sharing outstanding messages");
        self.drain(Worklists {
            share: share.into(),
            ..Worklists::default()
        })
    }

    /// The validator rejected the message.
    pub fn reject(&self, id: MessageId) -> StoreResult<()> {
        self.drain(Worklists {
            invalidate: VecDeque::from([id]),
            ..Worklists::default()
        })
    }

    /// Store a successful validation result and deliver the message if its
    /// dependencies allow.
    pub fn store_context(&self, message: &Message, context: &MessageContext) -> StoreResult<()> {
        let id = message.id();
        let result = self.store.transaction_blocking(false, |txn| {
            let mut changes = Changes::default();
            if txn.get_message_state(&id)? != MessageState::Unknown {
                return Ok(changes);
            }
            let group = txn.get_group(&message.group_id())?;
            let mut states = BTreeMap::new();
            if !context.dependencies.is_empty() {
                txn.add_message_dependencies(message, &context.dependencies)?;
                states = txn.get_message_dependencies(&id)?;
            }
            match readiness(&states) {
                Readiness::AnyInvalid => changes.invalidate(txn, id)?,
                Readiness::Waiting => {
                    txn.merge_message_metadata(&id, &context.metadata)?;
                    changes.set_state(txn, id, MessageState::Pending)?;
                }
                Readiness::AllDelivered => {
                    txn.merge_message_metadata(&id, &context.metadata)?;
                    self.deliver(
                        txn,
                        &mut changes,
                        message,
                        group.client(),
                        &context.metadata,
                        states.into_keys(),
                    )?;
                }
            }
            Ok(changes)
        });
        let changes = match result {
            Ok(changes) => changes,
            Err(e) if e.is_missing() => {
                info!(message = %id, error = %e, "message or group removed during validation");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let follow_up = self.commit(changes);
        self.drain(follow_up)
    }

    /// Hand a ready message to its client's hook and act on the answer.
    fn deliver(
        &self,
        txn: &mut dyn StoreTxn,
        changes: &mut Changes,
        message: &Message,
        client: &ClientKey,
        metadata: &Metadata,
        dependencies: impl IntoIterator<Item = MessageId>,
    ) -> StoreResult<()> {
        let id = message.id();
        match self.registry.deliver(txn, client, message, metadata) {
            DeliveryAction::Reject => changes.invalidate(txn, id)?,
            DeliveryAction::Defer => changes.set_state(txn, id, MessageState::Pending)?,
            DeliveryAction::AcceptShare => {
                changes.set_state(txn, id, MessageState::Delivered)?;
                changes.queue_pending_dependents(txn, &id)?;
                changes.share(txn, id)?;
                changes.follow_up.share.extend(dependencies);
            }
            DeliveryAction::AcceptDoNotShare => {
                changes.set_state(txn, id, MessageState::Delivered)?;
                changes.queue_pending_dependents(txn, &id)?;
                // Local messages are stored shared before delivery.
                if txn.is_message_shared(&id)? {
                    changes.follow_up.share.extend(dependencies);
                }
            }
        }
        Ok(())
    }

    fn step(&self, txn: &mut dyn StoreTxn, step: Step, id: MessageId) -> StoreResult<Changes> {
        let mut changes = Changes::default();
        match step {
            Step::Invalidate => changes.invalidate(txn, id)?,
            Step::Deliver => {
                if txn.get_message_state(&id)? != MessageState::Pending {
                    return Ok(changes);
                }
                let states = txn.get_message_dependencies(&id)?;
                match readiness(&states) {
                    Readiness::AnyInvalid => changes.invalidate(txn, id)?,
                    Readiness::Waiting => {}
                    Readiness::AllDelivered => {
                        let message = txn.get_message(&id)?;
                        let group = txn.get_group(&message.group_id())?;
                        let metadata = txn.get_message_metadata(&id)?;
                        self.deliver(
                            txn,
                            &mut changes,
                            &message,
                            group.client(),
                            &metadata,
                            states.into_keys(),
                        )?;
                    }
                }
            }
            Step::Share => {
                // Its dependencies were queued when it was first shared.
                if txn.is_message_shared(&id)? {
                    return Ok(changes);
                }
                changes.share(txn, id)?;
                changes
                    .follow_up
                    .share
                    .extend(txn.get_message_dependencies(&id)?.into_keys());
            }
        }
        Ok(changes)
    }

    /// Process worklists until empty, one transaction per id.
    pub fn drain(&self, mut lists: Worklists) -> StoreResult<()> {
        while let Some((step, id)) = lists.pop() {
            match self
                .store
                .transaction_blocking(false, |txn| self.step(txn, step, id))
            {
                Ok(changes) => lists.append(self.commit(changes)),
                Err(e) if e.is_missing() => {
                    info!(message = %id, step = ?step, error = %e, "message removed, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Announce committed changes and return their follow-up work.
    fn commit(&self, changes: Changes) -> Worklists {
        for event in changes.events {
            self.events.broadcast(event);
        }
        changes.follow_up
    }
}
