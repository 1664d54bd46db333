//! # Courier Testkit
//!
//! Testing utilities for Courier.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: byte streams with the records they must decode to
//! - **Generators**: Proptest strategies for ids, messages and sync records
//! - **Fixtures**: a memory store with a group and contacts, ready to use
//! - **Faults**: a store wrapper that makes messages vanish and operations fail
//!
//! ## Golden Vectors
//!
//! ```rust
//! use courier_testkit::vectors::all_vectors;
//!
//! for vector in all_vectors().iter().filter(|v| !v.error) {
//!     println!("{}: {} records", vector.name, vector.expected().len());
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use courier_testkit::generators::sync_message;
//!
//! proptest! {
//!     #[test]
//!     fn record_encoding_is_deterministic(message in sync_message()) {
//!         prop_assert_eq!(message.to_record().unwrap(), message.to_record().unwrap());
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust
//! use courier_core::{ContactId, Visibility};
//! use courier_testkit::fixtures::TestFixture;
//!
//! let fixture = TestFixture::new();
//! fixture.contact(ContactId(1), Visibility::Shared);
//! let message = fixture.add_sendable(1_000, b"hello");
//! ```

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use faults::{FaultyStore, FaultyTxn, Operation};
pub use fixtures::{multi_party_fixtures, test_client, TestFixture};
