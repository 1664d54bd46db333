//! # Courier
//!
//! A store-and-forward sync engine for groups of messages shared between
//! contacts over untrusted, possibly one-way transports.
//!
//! ## Overview
//!
//! [`SyncNode`] ties the pieces together:
//!
//! - **Sessions**: incoming streams are applied record by record; outgoing
//!   sessions send acks, requests and messages in one of three shapes
//!   (eager, duplex, mailbox)
//! - **Validation**: messages pass through client validators and delivery
//!   hooks, waiting for their dependencies before delivery
//! - **Storage**: everything lives in a [`store::Store`], SQLite or memory
//!
//! ## Usage
//!
//! ```rust,no_run
//! use courier::{NodeConfig, SyncNode};
//! use courier::core::{
//!     ClientId, ClientKey, ContactId, Group, InvalidMessageError, Message, MessageContext,
//! };
//! use courier::store::SqliteStore;
//!
//! async fn example() -> courier::Result<()> {
//!     let store = SqliteStore::open("courier.db")?;
//!     let node = SyncNode::new(store, NodeConfig::default());
//!
//!     let client = ClientKey::new(ClientId::new("org.example.chat")?, 0);
//!     node.register_message_validator(
//!         client.clone(),
//!         |_: &Message, _: &Group| -> Result<MessageContext, InvalidMessageError> {
//!             Ok(MessageContext::default())
//!         },
//!     )?;
//!     node.start().await?;
//!
//!     let group = Group::new(client, b"room".to_vec())?;
//!     node.add_group(&group).await?;
//!     node.add_contact(ContactId(1)).await?;
//!     node.add_local_message(&group.id(), 1_700_000_000_000, b"hello").await?;
//!
//!     let mut file = Vec::new();
//!     node.send_eager(ContactId(1), &mut file).await?;
//!     node.stop().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `courier::core` - identifiers, messages, records
//! - `courier::store` - storage abstraction, SQLite and memory stores, events
//! - `courier::sync` - record streams and sessions
//! - `courier::validation` - validators, hooks and the validation service

pub mod error;
pub mod node;

pub use courier_core as core;
pub use courier_store as store;
pub use courier_sync as sync;
pub use courier_validation as validation;

pub use error::{NodeError, Result};
pub use node::{NodeConfig, SyncNode};

pub use courier_core::{
    ClientId, ClientKey, ContactId, Group, GroupId, Message, MessageId, MessageState, Visibility,
};
pub use courier_store::Event;
pub use courier_sync::{IncomingReport, OutgoingSessionRecord, SessionHandle, SessionReport};
pub use courier_validation::{DeliveryAction, HookError};
