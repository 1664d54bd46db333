//! The node: one store, one event bus, one validation service, and the
//! sessions that run against them.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use courier_core::{
    ClientKey, ContactId, Group, GroupId, Message, MessageId, MessageState, Visibility,
};
use courier_store::{Event, EventBus, EventListener, Store, DEFAULT_EVENT_CAPACITY};
use courier_sync::{
    IncomingReport, IncomingSession, OutgoingSession, OutgoingSessionRecord, SessionHandle,
    SessionPolicy, SessionReport, SyncConfig,
};
use courier_validation::{
    IncomingMessageHook, MessageValidator, ValidationConfig, ValidationManager,
};

use crate::error::Result;

/// Configuration for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Session configuration.
    pub sync: SyncConfig,
    /// Validation service configuration.
    pub validation: ValidationConfig,
    /// Events buffered per bus listener.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            validation: ValidationConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// A sync node.
///
/// Provides a unified API for:
/// - Registering clients (validators and delivery hooks)
/// - Managing contacts, groups and group visibility
/// - Creating local messages
/// - Running incoming and outgoing sessions
pub struct SyncNode<S: Store> {
    store: S,
    events: EventBus,
    validation: ValidationManager<S>,
    config: NodeConfig,
}

impl<S: Store> SyncNode<S> {
    pub fn new(store: S, config: NodeConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let validation =
            ValidationManager::new(store.clone(), events.clone(), config.validation.clone());
        Self {
            store,
            events,
            validation,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Clients and lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub fn register_message_validator(
        &self,
        client: ClientKey,
        validator: impl MessageValidator,
    ) -> Result<()> {
        Ok(self.validation.register_message_validator(client, validator)?)
    }

    pub fn register_incoming_message_hook(
        &self,
        client: ClientKey,
        hook: impl IncomingMessageHook,
    ) -> Result<()> {
        Ok(self.validation.register_incoming_message_hook(client, hook)?)
    }

    /// Start the validation service. Registrations are closed from here on.
    pub async fn start(&self) -> Result<()> {
        self.validation.start_service().await?;
        info!("node started");
        Ok(())
    }

    /// Interrupt running sessions and stop the validation service.
    pub async fn stop(&self) -> Result<()> {
        self.events.broadcast(Event::Shutdown);
        self.validation.stop_service().await?;
        info!("node stopped");
        Ok(())
    }

    /// Resolve once the validation service has no work queued or running.
    pub async fn wait_until_idle(&self) {
        self.validation.wait_until_idle().await
    }

    pub fn subscribe(&self) -> EventListener {
        self.events.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Contacts and groups
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn add_contact(&self, contact: ContactId) -> Result<()> {
        self.store
            .transaction(false, move |txn| txn.add_contact(contact))
            .await?;
        debug!(contact = %contact, "contact added");
        Ok(())
    }

    /// Remove a contact and interrupt its sessions.
    pub async fn remove_contact(&self, contact: ContactId) -> Result<()> {
        self.store
            .transaction(false, move |txn| txn.remove_contact(contact))
            .await?;
        self.events.broadcast(Event::ContactRemoved { contact });
        debug!(contact = %contact, "contact removed");
        Ok(())
    }

    pub async fn add_group(&self, group: &Group) -> Result<()> {
        let group = group.clone();
        self.store
            .transaction(false, move |txn| txn.add_group(&group))
            .await?;
        Ok(())
    }

    pub async fn set_group_visibility(
        &self,
        contact: ContactId,
        group: &GroupId,
        visibility: Visibility,
    ) -> Result<()> {
        let group = *group;
        self.store
            .transaction(false, move |txn| {
                txn.set_group_visibility(contact, &group, visibility)
            })
            .await?;
        self.events.broadcast(Event::GroupVisibilityUpdated { contact });
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a message in a group. It is stored shared and `Unknown`, then
    /// validated and delivered like any received message.
    pub async fn add_local_message(
        &self,
        group: &GroupId,
        timestamp: u64,
        body: &[u8],
    ) -> Result<Message> {
        let message = Message::new(*group, timestamp, body)?;
        let stored = message.clone();
        self.store
            .transaction(false, move |txn| {
                txn.add_message(&stored, MessageState::Unknown, true, None)
            })
            .await?;
        debug!(message = %message.id(), "local message added");
        self.events.broadcast(Event::MessageAdded {
            message: message.clone(),
            source: None,
        });
        Ok(message)
    }

    pub async fn message_state(&self, id: &MessageId) -> Result<MessageState> {
        let id = *id;
        Ok(self
            .store
            .transaction(true, move |txn| txn.get_message_state(&id))
            .await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────

    /// Read a stream from `contact` to its end and apply it.
    pub async fn receive<R>(&self, contact: ContactId, reader: R) -> Result<IncomingReport>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut session =
            IncomingSession::new(self.store.clone(), self.events.clone(), contact, reader);
        Ok(session.run().await?)
    }

    /// Send everything the contact has not acked over a one-way stream.
    pub async fn send_eager<W>(&self, contact: ContactId, writer: W) -> Result<SessionReport>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut session = OutgoingSession::eager(
            self.store.clone(),
            self.events.clone(),
            contact,
            self.config.sync.max_latency,
            writer,
        );
        Ok(session.run().await?)
    }

    /// The outgoing half of a two-way connection with the contact. Offers
    /// due messages, sends what the contact requests and stays open until
    /// `handle` is closed or interrupted. A handle closed up front makes a
    /// single pass.
    pub async fn send_duplex<W>(
        &self,
        contact: ContactId,
        writer: W,
        handle: SessionHandle,
    ) -> Result<SessionReport>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let policy = SessionPolicy::duplex().with_keep_open(self.config.sync.keep_open());
        let mut session = OutgoingSession::new(
            self.store.clone(),
            self.events.clone(),
            contact,
            self.config.sync.max_latency,
            policy,
            writer,
        )
        .with_handle(handle);
        Ok(session.run().await?)
    }

    /// Pack a mailbox file for the contact. Nothing is marked as sent until
    /// [`SyncNode::mailbox_uploaded`] is called with the report's record.
    /// `capacity` defaults to the configured mailbox capacity.
    pub async fn send_mailbox<W>(
        &self,
        contact: ContactId,
        writer: W,
        capacity: Option<u64>,
    ) -> Result<SessionReport>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut session = OutgoingSession::mailbox(
            self.store.clone(),
            self.events.clone(),
            contact,
            self.config.sync.max_latency,
            capacity.unwrap_or(self.config.sync.mailbox_capacity),
            writer,
        );
        Ok(session.run().await?)
    }

    /// A mailbox file was uploaded: record its acks and messages as sent.
    pub async fn mailbox_uploaded(
        &self,
        contact: ContactId,
        record: &OutgoingSessionRecord,
    ) -> Result<()> {
        let record = record.clone();
        let max_latency = self.config.sync.max_latency;
        self.store
            .transaction(false, move |txn| record.apply(txn, contact, max_latency))
            .await?;
        debug!(contact = %contact, "mailbox upload recorded");
        Ok(())
    }
}
