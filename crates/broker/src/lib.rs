//! Custodian Broker - leased service accounts with zero-downtime rotation
//!
//! Lends pooled upstream identities to one borrower at a time and keeps the
//! credentials behind them fresh.
//!
//! # Features
//!
//! - **Library sets** - named identity pools with lease policy and
//!   check-out / check-in
//! - **Admin credential rotation** - create, validate, commit, revoke; never
//!   without a working credential
//! - **Static roles** - fixed identities whose keys rotate on their own
//!   schedule
//! - **Restart safe** - the durable store is the only source of truth
#![forbid(unsafe_code)]

/// Administrative credential
pub mod admin;
/// Broker handle and lifecycle
pub mod broker;
/// Per-identity check-out state
pub mod checkout;
/// Broker configuration
pub mod config;
/// Error types
pub mod error;
/// Library sets
pub mod library;
/// Named async locks
pub mod locks;
/// Scheduler, swap protocol and retry
pub mod rotation;
/// Zeroizing secret strings
pub mod secret;
/// Static roles
pub mod static_role;
/// Durable key-value storage
pub mod store;
/// Upstream API traits
pub mod upstream;

/// Test doubles for the upstream API and the store
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// ── Root re-exports ─────────────────────────────────────────────────────────

pub use crate::admin::{AdminCredential, AdminCredentialConfig, AdminCredentialView, AdminRotation};
pub use crate::broker::Broker;
pub use crate::checkout::{Borrower, CheckOut, CheckOutState};
pub use crate::config::{BrokerConfig, ConfigError, OverlapPolicy};
pub use crate::error::{BrokerError, BrokerResult, ResourceKind, StoreError, UpstreamError};
pub use crate::library::{CheckInRequest, CheckOutOutcome, Lease, LibrarySet, MemberStatus};
pub use crate::secret::SecretString;
pub use crate::static_role::{StaticRoleCredential, StaticRoleDefinition};
pub use crate::store::{DurableStore, MemoryStore};
pub use crate::upstream::{ApiKey, Identity, UpstreamClient, UpstreamConnector};

/// Commonly used types and traits
pub mod prelude {
    pub use crate::admin::{AdminCredentialConfig, AdminRotation};
    pub use crate::broker::Broker;
    pub use crate::checkout::Borrower;
    pub use crate::config::{BrokerConfig, OverlapPolicy};
    pub use crate::error::{BrokerError, BrokerResult};
    pub use crate::library::{CheckInRequest, CheckOutOutcome, LibrarySet};
    pub use crate::rotation::RotationKey;
    pub use crate::secret::SecretString;
    pub use crate::static_role::StaticRoleDefinition;
    pub use crate::store::{DurableStore, MemoryStore};
    pub use crate::upstream::{UpstreamClient, UpstreamConnector};
}
