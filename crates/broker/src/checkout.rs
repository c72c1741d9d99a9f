//! Per-identity check-out state
//!
//! Each managed identity has one [`CheckOut`] record. The record is the only
//! thing that says whether the identity is borrowed, so it is written before
//! a key is minted and rolled back if minting fails. A rollback compares
//! against the record the check-out wrote and never clears anyone else's.
//!
//! [`CheckoutStore`] does a read-then-write on the record. Callers must hold
//! the owning library set's exclusive lock across [`CheckoutStore::check_out`]
//! and [`CheckoutStore::check_in`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult, ResourceKind};
use crate::store::{self, DurableStore, keys};
use crate::upstream::UpstreamClient;

/// Who is asking to borrow or return an identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Borrower {
    /// Opaque caller identity
    pub entity_id: String,
    /// Fingerprint of the caller's credential
    pub token: String,
}

impl Borrower {
    pub fn new(entity_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            token: token.into(),
        }
    }

    /// Whether this caller is the one recorded on `record`
    ///
    /// Empty fields never match, so an anonymous caller cannot claim a
    /// record borrowed by another anonymous caller.
    pub fn matches(&self, record: &CheckOut) -> bool {
        let entity = !self.entity_id.is_empty() && self.entity_id == record.borrower_entity_id;
        let token = !self.token.is_empty() && self.token == record.borrower_token;
        entity || token
    }
}

/// Availability state derived from a [`CheckOut`] record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutState {
    Available,
    CheckedOut,
}

impl fmt::Display for CheckOutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckOutState::Available => write!(f, "available"),
            CheckOutState::CheckedOut => write!(f, "checked_out"),
        }
    }
}

/// Persisted borrow state of one identity
///
/// `is_available` implies both borrower fields are empty and no checkout
/// time is set; the constructors are the only way the broker builds one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOut {
    pub is_available: bool,
    pub borrower_entity_id: String,
    pub borrower_token: String,
    pub checked_out_at: Option<DateTime<Utc>>,
}

impl CheckOut {
    /// Record for an identity nobody holds
    pub fn available() -> Self {
        Self {
            is_available: true,
            borrower_entity_id: String::new(),
            borrower_token: String::new(),
            checked_out_at: None,
        }
    }

    /// Record for an identity held by `borrower` since `at`
    pub fn borrowed_by(borrower: &Borrower, at: DateTime<Utc>) -> Self {
        Self {
            is_available: false,
            borrower_entity_id: borrower.entity_id.clone(),
            borrower_token: borrower.token.clone(),
            checked_out_at: Some(at),
        }
    }

    pub fn state(&self) -> CheckOutState {
        if self.is_available {
            CheckOutState::Available
        } else {
            CheckOutState::CheckedOut
        }
    }
}

/// Whether `requester` may return an identity described by `record`
///
/// Always true for an available record, for a forced check-in, or when the
/// set does not enforce borrower check-in.
pub fn may_check_in(record: &CheckOut, requester: &Borrower, force: bool, enforce: bool) -> bool {
    record.is_available || force || !enforce || requester.matches(record)
}

/// Mapping from identity to the key minted for its current borrower
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHandle {
    pub identity_id: String,
    pub key_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Check-out records and key handles in the durable store
#[derive(Clone)]
pub struct CheckoutStore {
    store: Arc<dyn DurableStore>,
}

impl CheckoutStore {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Start managing `identity_id` as available
    pub async fn seed_available(&self, identity_id: &str) -> BrokerResult<()> {
        self.write(identity_id, &CheckOut::available()).await
    }

    /// Mark `identity_id` as borrowed by `borrower`
    ///
    /// Fails with `NotFound` for an unmanaged identity and with
    /// `AlreadyCheckedOut` if someone else holds it.
    pub async fn check_out(&self, identity_id: &str, borrower: &Borrower) -> BrokerResult<CheckOut> {
        let current = self.load_checkout(identity_id).await?;
        if !current.is_available {
            return Err(BrokerError::AlreadyCheckedOut {
                identity_id: identity_id.to_string(),
            });
        }

        let record = CheckOut::borrowed_by(borrower, Utc::now());
        self.write(identity_id, &record).await?;
        tracing::debug!(identity_id = %identity_id, "Identity checked out");
        Ok(record)
    }

    /// Return `identity_id` to the pool
    ///
    /// Idempotent: an available identity stays available. Returns the key
    /// handle that was tracked for the borrower, already removed from the
    /// store, so the caller can delete the key once the set lock is released
    /// (see [`revoke_key`]).
    pub async fn check_in(&self, identity_id: &str) -> BrokerResult<Option<KeyHandle>> {
        let current = self.load_checkout(identity_id).await?;
        let handle = self.take_key_handle(identity_id).await?;

        if !current.is_available {
            self.write(identity_id, &CheckOut::available()).await?;
            tracing::debug!(identity_id = %identity_id, "Identity checked in");
        }
        Ok(handle)
    }

    /// Undo a check-out whose key could not be issued
    ///
    /// Resets the record only while it still equals `claimed`, and returns
    /// whether it did. A record that was checked in, lent again or retired
    /// in the meantime belongs to someone else and is left alone.
    pub async fn release(&self, identity_id: &str, claimed: &CheckOut) -> BrokerResult<bool> {
        if !self.still_held(identity_id, claimed).await? {
            return Ok(false);
        }
        self.seed_available(identity_id).await?;
        Ok(true)
    }

    /// Whether `identity_id` is still borrowed under `claimed`
    pub async fn still_held(&self, identity_id: &str, claimed: &CheckOut) -> BrokerResult<bool> {
        match self.load_checkout(identity_id).await {
            Ok(current) => Ok(current == *claimed),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Current record, `NotFound` for an unmanaged identity
    pub async fn load_checkout(&self, identity_id: &str) -> BrokerResult<CheckOut> {
        store::get_json(self.store.as_ref(), &keys::checkout(identity_id))
            .await?
            .ok_or_else(|| BrokerError::not_found(ResourceKind::Identity, identity_id))
    }

    /// Stop managing `identity_id`; returns the key handle that was tracked
    pub async fn delete_checkout(&self, identity_id: &str) -> BrokerResult<Option<KeyHandle>> {
        let handle = self.take_key_handle(identity_id).await?;
        self.store.delete(&keys::checkout(identity_id)).await?;
        Ok(handle)
    }

    pub async fn put_key_handle(&self, handle: &KeyHandle) -> BrokerResult<()> {
        store::put_json(
            self.store.as_ref(),
            &keys::key_handle(&handle.identity_id),
            handle,
        )
        .await?;
        Ok(())
    }

    pub async fn key_handle(&self, identity_id: &str) -> BrokerResult<Option<KeyHandle>> {
        Ok(store::get_json(self.store.as_ref(), &keys::key_handle(identity_id)).await?)
    }

    async fn take_key_handle(&self, identity_id: &str) -> BrokerResult<Option<KeyHandle>> {
        let handle = self.key_handle(identity_id).await?;
        if handle.is_some() {
            self.store.delete(&keys::key_handle(identity_id)).await?;
        }
        Ok(handle)
    }

    async fn write(&self, identity_id: &str, record: &CheckOut) -> BrokerResult<()> {
        store::put_json(self.store.as_ref(), &keys::checkout(identity_id), record).await?;
        Ok(())
    }
}

/// Best-effort deletion of a borrower's key
///
/// Failure is logged, not returned: the key lapses on its own lease, while
/// failing the check-in would strand the identity.
pub async fn revoke_key(client: Option<&dyn UpstreamClient>, handle: &KeyHandle) {
    let Some(client) = client else {
        tracing::warn!(
            identity_id = %handle.identity_id,
            key_id = %handle.key_id,
            "No admin credential configured; leaving key to expire"
        );
        return;
    };

    if let Err(e) = client.delete_key(&handle.key_id).await {
        tracing::warn!(
            identity_id = %handle.identity_id,
            key_id = %handle.key_id,
            error = %e,
            "Failed to delete borrowed key; it will lapse with its lease"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn store() -> CheckoutStore {
        CheckoutStore::new(MemoryStore::new())
    }

    fn handle(identity_id: &str) -> KeyHandle {
        KeyHandle {
            identity_id: identity_id.to_string(),
            key_id: format!("{identity_id}-key"),
            issued_at: Utc::now(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_unmanaged_identity_is_not_found() {
        let checkouts = store();
        let err = checkouts
            .check_out("sa-1", &Borrower::new("e1", "t1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(checkouts.load_checkout("sa-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_round_trip_borrower_fields() {
        let checkouts = store();
        checkouts.seed_available("sa-1").await.unwrap();

        let borrower = Borrower::new("entity-7", "token-fp");
        checkouts.check_out("sa-1", &borrower).await.unwrap();

        let record = checkouts.load_checkout("sa-1").await.unwrap();
        assert_eq!(record.state(), CheckOutState::CheckedOut);
        assert_eq!(record.borrower_entity_id, "entity-7");
        assert_eq!(record.borrower_token, "token-fp");
        assert!(record.checked_out_at.is_some());

        checkouts.check_in("sa-1").await.unwrap();
        assert_eq!(checkouts.load_checkout("sa-1").await.unwrap(), CheckOut::available());
    }

    #[tokio::test]
    async fn test_second_check_out_is_rejected() {
        let checkouts = store();
        checkouts.seed_available("sa-1").await.unwrap();
        checkouts
            .check_out("sa-1", &Borrower::new("a", ""))
            .await
            .unwrap();

        let err = checkouts
            .check_out("sa-1", &Borrower::new("b", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyCheckedOut { ref identity_id } if identity_id == "sa-1"));
    }

    #[tokio::test]
    async fn test_check_in_twice_is_noop() {
        let checkouts = store();
        checkouts.seed_available("sa-1").await.unwrap();
        checkouts
            .check_out("sa-1", &Borrower::new("a", ""))
            .await
            .unwrap();

        checkouts.check_in("sa-1").await.unwrap();
        checkouts.check_in("sa-1").await.unwrap();
        assert!(checkouts.load_checkout("sa-1").await.unwrap().is_available);
    }

    #[tokio::test]
    async fn test_check_in_takes_key_handle() {
        let checkouts = store();
        checkouts.seed_available("sa-1").await.unwrap();
        checkouts
            .check_out("sa-1", &Borrower::new("a", ""))
            .await
            .unwrap();
        checkouts.put_key_handle(&handle("sa-1")).await.unwrap();

        let taken = checkouts.check_in("sa-1").await.unwrap();
        assert_eq!(taken.map(|h| h.key_id), Some("sa-1-key".to_string()));
        assert!(checkouts.key_handle("sa-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_handle_cleared_on_available_check_in() {
        let checkouts = store();
        checkouts.seed_available("sa-1").await.unwrap();
        checkouts.put_key_handle(&handle("sa-1")).await.unwrap();

        let taken = checkouts.check_in("sa-1").await.unwrap();
        assert!(taken.is_some());
        assert!(checkouts.load_checkout("sa-1").await.unwrap().is_available);
    }

    #[tokio::test]
    async fn test_delete_checkout_removes_both_records() {
        let checkouts = store();
        checkouts.seed_available("sa-1").await.unwrap();
        checkouts.put_key_handle(&handle("sa-1")).await.unwrap();

        let taken = checkouts.delete_checkout("sa-1").await.unwrap();
        assert!(taken.is_some());
        assert!(checkouts.load_checkout("sa-1").await.unwrap_err().is_not_found());
        assert!(checkouts.key_handle("sa-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_only_undoes_own_claim() {
        let checkouts = store();
        checkouts.seed_available("sa-1").await.unwrap();
        let stale = checkouts
            .check_out("sa-1", &Borrower::new("a", ""))
            .await
            .unwrap();
        checkouts.check_in("sa-1").await.unwrap();
        let current = checkouts
            .check_out("sa-1", &Borrower::new("b", ""))
            .await
            .unwrap();

        assert!(!checkouts.release("sa-1", &stale).await.unwrap());
        assert_eq!(checkouts.load_checkout("sa-1").await.unwrap(), current);

        assert!(checkouts.release("sa-1", &current).await.unwrap());
        assert!(checkouts.load_checkout("sa-1").await.unwrap().is_available);
    }

    #[tokio::test]
    async fn test_release_does_not_resurrect_retired_identity() {
        let checkouts = store();
        checkouts.seed_available("sa-1").await.unwrap();
        let claimed = checkouts
            .check_out("sa-1", &Borrower::new("a", ""))
            .await
            .unwrap();
        checkouts.delete_checkout("sa-1").await.unwrap();

        assert!(!checkouts.release("sa-1", &claimed).await.unwrap());
        assert!(checkouts.load_checkout("sa-1").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_borrower_matching() {
        let record = CheckOut::borrowed_by(&Borrower::new("e1", "t1"), Utc::now());

        assert!(Borrower::new("e1", "other").matches(&record));
        assert!(Borrower::new("", "t1").matches(&record));
        assert!(!Borrower::new("e2", "t2").matches(&record));

        let anonymous = CheckOut::borrowed_by(&Borrower::default(), Utc::now());
        assert!(!Borrower::default().matches(&anonymous));
    }

    #[test]
    fn test_check_in_authorization() {
        let record = CheckOut::borrowed_by(&Borrower::new("e1", "t1"), Utc::now());
        let stranger = Borrower::new("e2", "t2");

        assert!(!may_check_in(&record, &stranger, false, true));
        assert!(may_check_in(&record, &stranger, true, true));
        assert!(may_check_in(&record, &stranger, false, false));
        assert!(may_check_in(&CheckOut::available(), &stranger, false, true));
    }
}
