//! Error types for broker operations
//!
//! Three tiers, in the shape the rest of the crate relies on:
//! - [`BrokerError`]: what request-scoped operations return to callers
//! - [`StoreError`]: failures of the durable store or of record encoding
//! - [`UpstreamError`]: failures reported by the upstream API

use std::fmt;

use thiserror::Error;

/// Kind of object a lookup failed to find
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Identity with no checkout record (not managed by any set)
    Identity,
    /// Library set
    LibrarySet,
    /// Static role
    StaticRole,
    /// The administrative credential
    AdminCredential,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Identity => write!(f, "identity"),
            ResourceKind::LibrarySet => write!(f, "library set"),
            ResourceKind::StaticRole => write!(f, "static role"),
            ResourceKind::AdminCredential => write!(f, "admin credential"),
        }
    }
}

/// Top-level broker error
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Unmanaged identity, unknown set or role, or no admin credential
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// What was looked up
        kind: ResourceKind,
        /// Name or id used for the lookup
        name: String,
    },

    /// Identity is already borrowed
    #[error("Identity '{identity_id}' is already checked out")]
    AlreadyCheckedOut {
        /// Contended identity
        identity_id: String,
    },

    /// Identity was returned or retired while its key was being minted
    #[error("Check-out of identity '{identity_id}' ended before its key was issued")]
    CheckOutLost {
        /// Identity whose check-out ended
        identity_id: String,
    },

    /// Check-in attempted by someone other than the borrower
    #[error("Requester is not the borrower of identity '{identity_id}'")]
    Unauthorized {
        /// Identity the requester tried to return
        identity_id: String,
    },

    /// Bad input (lease ordering, empty member list, missing field, overlap)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Broker configuration could not be loaded
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Upstream API failure
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Durable store failure
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Credential creation kept failing
    #[error("Maximum attempts ({attempts}) exceeded for {operation}: {source}")]
    MaxRetriesExceeded {
        /// Operation that was retried
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Error from the last attempt
        #[source]
        source: UpstreamError,
    },

    /// Swap state machine was driven out of order
    #[error("Invalid swap state transition from {from} to {to}")]
    InvalidStateTransition {
        /// State the swap was in
        from: String,
        /// State that was requested
        to: String,
    },
}

impl BrokerError {
    /// Shorthand for [`BrokerError::NotFound`]
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Shorthand for [`BrokerError::Validation`]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Whether this error is a [`BrokerError::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Durable store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend rejected or failed the operation
    #[error("Store backend failed on '{key}': {reason}")]
    Backend {
        /// Key being accessed
        key: String,
        /// Backend message
        reason: String,
    },

    /// Record could not be serialized
    #[error("Failed to encode record '{key}': {source}")]
    Encode {
        /// Key being written
        key: String,
        /// Serializer error
        #[source]
        source: serde_json::Error,
    },

    /// Persisted bytes could not be deserialized
    #[error("Failed to decode record '{key}': {source}")]
    Decode {
        /// Key being read
        key: String,
        /// Deserializer error
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Shorthand for [`StoreError::Backend`]
    pub fn backend(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Backend {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Upstream API errors
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// Request failed (network, 5xx, throttling)
    #[error("Upstream request '{operation}' failed: {reason}")]
    Request {
        /// Upstream operation name
        operation: String,
        /// Failure description
        reason: String,
    },

    /// Upstream object does not exist
    #[error("Upstream object not found: {0}")]
    NotFound(String),

    /// Credential was rejected
    #[error("Upstream rejected credential: {0}")]
    Unauthenticated(String),
}

impl UpstreamError {
    /// Shorthand for [`UpstreamError::Request`]
    pub fn request(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Request {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Request { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_not_found_message_names_kind() {
        let err = BrokerError::not_found(ResourceKind::LibrarySet, "ci-pool");
        assert_eq!(err.to_string(), "library set 'ci-pool' not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_upstream_converts_with_question_mark() {
        fn call() -> BrokerResult<()> {
            Err(UpstreamError::request("create_key", "503"))?
        }
        let err = call().unwrap_err();
        assert!(matches!(err, BrokerError::Upstream(_)));
        assert!(err.to_string().contains("create_key"));
    }

    #[test]
    fn test_max_retries_keeps_source() {
        let err = BrokerError::MaxRetriesExceeded {
            operation: "create admin credential".to_string(),
            attempts: 3,
            source: UpstreamError::request("create_admin_credential", "timeout"),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("(3)"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(UpstreamError::request("x", "y").is_transient());
        assert!(!UpstreamError::NotFound("sa".into()).is_transient());
        assert!(!UpstreamError::Unauthenticated("bad".into()).is_transient());
    }
}
