//! Test doubles
//!
//! [`MockUpstream`] is an in-memory upstream with identities, keys and admin
//! credentials, failure injection and call counters. [`FlakyStore`] wraps a
//! [`MemoryStore`](crate::store::MemoryStore) and fails selected writes.

mod mocks;

pub use mocks::{FlakyStore, MockClient, MockConnector, MockUpstream};
