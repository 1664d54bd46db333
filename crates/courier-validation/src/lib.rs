//! # Courier Validation
//!
//! Validation and ordered delivery of messages.
//!
//! ## Overview
//!
//! A message arrives as opaque bytes in state `Unknown`. Its client's
//! [`MessageValidator`] checks it and names the messages it depends on. The
//! message is delivered (handed to the client's [`IncomingMessageHook`])
//! only once every dependency has been delivered; if any dependency is
//! invalid, so is the message, and invalidity propagates to everything
//! that depends on it.
//!
//! ```text
//! Unknown ──validate──▶ Pending ──deps delivered──▶ Delivered
//!    │                     │
//!    └──────rejected───────┴──────────────────────▶ Invalid
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use courier_core::{ClientId, ClientKey, Group, InvalidMessageError, Message, MessageContext};
//! use courier_store::{EventBus, MemoryStore};
//! use courier_validation::{ValidationConfig, ValidationManager};
//!
//! async fn example() -> courier_validation::Result<()> {
//!     let manager = ValidationManager::new(
//!         MemoryStore::new(),
//!         EventBus::default(),
//!         ValidationConfig::default(),
//!     );
//!     let client = ClientKey::new(ClientId::new("org.example.chat").unwrap(), 0);
//!     manager.register_message_validator(
//!         client,
//!         |_: &Message, _: &Group| -> Result<MessageContext, InvalidMessageError> {
//!             Ok(MessageContext::default())
//!         },
//!     )?;
//!     manager.start_service().await?;
//!     manager.wait_until_idle().await;
//!     manager.stop_service().await
//! }
//! ```

pub mod engine;
pub mod error;
pub mod manager;
pub mod registry;
pub mod tracker;

pub use engine::{DeliveryEngine, Worklists};
pub use error::{Result, ValidationError};
pub use manager::{ValidationConfig, ValidationManager};
pub use registry::{DeliveryAction, HookError, IncomingMessageHook, MessageValidator, Registry};
pub use tracker::WorkTracker;
