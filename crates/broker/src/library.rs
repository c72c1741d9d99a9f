//! Library sets: named pools of identities lent out one borrower at a time
//!
//! Every operation on a set runs under that set's [`NamedLocks`] entry:
//! exclusive for mutations, check-out and check-in, shared for reads. Sets
//! with different names never contend.
//!
//! [`NamedLocks`]: crate::locks::NamedLocks

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::broker::BrokerContext;
use crate::checkout::{self, Borrower, CheckOut, KeyHandle, may_check_in};
use crate::config::OverlapPolicy;
use crate::error::{BrokerError, BrokerResult, ResourceKind, UpstreamError};
use crate::secret::SecretString;
use crate::store::{self, DurableStore, keys};
use crate::upstream::UpstreamClient;

/// Named pool of identities sharing one lease policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrarySet {
    pub name: String,
    /// Members in check-out order
    pub member_identity_ids: Vec<String>,
    /// Upstream project or namespace the members live in
    pub external_scope: String,
    /// Lease when the caller asks for none; zero means unbounded
    #[serde(with = "humantime_serde")]
    pub default_lease: Duration,
    /// Upper bound on any lease; zero means unbounded
    #[serde(with = "humantime_serde")]
    pub max_lease: Duration,
    /// Only the borrower may check an identity back in
    pub enforce_borrower_check_in: bool,
}

impl LibrarySet {
    /// Set with a 1h default lease, 24h maximum and borrower enforcement
    pub fn new<I, S>(name: impl Into<String>, members: I, external_scope: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            member_identity_ids: members.into_iter().map(Into::into).collect(),
            external_scope: external_scope.into(),
            default_lease: Duration::from_secs(3600),
            max_lease: Duration::from_secs(24 * 3600),
            enforce_borrower_check_in: true,
        }
    }

    pub fn with_leases(mut self, default_lease: Duration, max_lease: Duration) -> Self {
        self.default_lease = default_lease;
        self.max_lease = max_lease;
        self
    }

    pub fn with_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_borrower_check_in = enforce;
        self
    }

    pub fn contains(&self, identity_id: &str) -> bool {
        self.member_identity_ids.iter().any(|id| id == identity_id)
    }

    /// Check field constraints; duplicate members are rejected
    pub fn validate(&self) -> BrokerResult<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(BrokerError::validation(
                "set name must be non-empty and must not contain '/'",
            ));
        }
        if self.external_scope.is_empty() {
            return Err(BrokerError::validation("external_scope is required"));
        }
        if self.member_identity_ids.is_empty() {
            return Err(BrokerError::validation(
                "a library set needs at least one member identity",
            ));
        }

        let mut seen = HashSet::new();
        for id in &self.member_identity_ids {
            if id.is_empty() {
                return Err(BrokerError::validation("member identity ids must not be empty"));
            }
            if !seen.insert(id.as_str()) {
                return Err(BrokerError::validation(format!(
                    "identity '{id}' is listed more than once"
                )));
            }
        }

        if !self.max_lease.is_zero() && self.default_lease > self.max_lease {
            return Err(BrokerError::validation(format!(
                "default_lease ({:?}) exceeds max_lease ({:?})",
                self.default_lease, self.max_lease
            )));
        }
        Ok(())
    }

    /// Lease granted for a requested ttl
    ///
    /// The smallest of the requested ttl, the default lease and the maximum
    /// lease, ignoring any that are zero. A request can shorten the default
    /// but never lengthen it. Zero result means unbounded.
    pub fn lease_for(&self, requested: Duration) -> Duration {
        [requested, self.default_lease, self.max_lease]
            .into_iter()
            .filter(|d| !d.is_zero())
            .min()
            .unwrap_or(Duration::ZERO)
    }
}

/// Borrowed identity with its freshly minted key
#[derive(Debug, Clone)]
pub struct Lease {
    pub set_name: String,
    pub identity_id: String,
    pub key_id: String,
    pub secret: SecretString,
    /// Zero when the set leaves leases unbounded
    pub lease_duration: Duration,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of a check-out
///
/// An exhausted pool is a normal outcome, not an error: callers retry or
/// poll [`status`](LibrarySetManager::status).
#[derive(Debug, Clone)]
pub enum CheckOutOutcome {
    Granted(Lease),
    NoneAvailable,
}

impl CheckOutOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    pub fn into_lease(self) -> Option<Lease> {
        match self {
            Self::Granted(lease) => Some(lease),
            Self::NoneAvailable => None,
        }
    }
}

/// Which identities to return, and on whose behalf
#[derive(Debug, Clone, Default)]
pub struct CheckInRequest {
    /// Empty means "the one identity this requester has checked out"
    pub identities: Vec<String>,
    pub requester: Borrower,
    /// Administrative override of borrower enforcement
    pub force: bool,
}

impl CheckInRequest {
    pub fn by(requester: Borrower) -> Self {
        Self {
            requester,
            ..Self::default()
        }
    }

    pub fn identities<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identities = identities.into_iter().map(Into::into).collect();
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Availability of one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberStatus {
    pub identity_id: String,
    pub available: bool,
    pub borrower_entity_id: Option<String>,
    pub borrower_token: Option<String>,
    pub checked_out_at: Option<DateTime<Utc>>,
}

/// Which sets manage each identity
///
/// Derived from the persisted sets and rebuilt on startup; never
/// authoritative on its own.
#[derive(Debug, Default)]
pub struct ManagedIdentities {
    owners: DashMap<String, BTreeSet<String>>,
}

impl ManagedIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry with the membership of every persisted set
    pub async fn rebuild(&self, store: &dyn DurableStore) -> BrokerResult<()> {
        self.owners.clear();
        for name in store.list(keys::LIBRARY_PREFIX).await? {
            let Some(set) = store::get_json::<LibrarySet>(store, &keys::library(&name)).await? else {
                continue;
            };
            for id in &set.member_identity_ids {
                self.owners
                    .entry(id.clone())
                    .or_default()
                    .insert(set.name.clone());
            }
        }
        tracing::debug!(identities = self.owners.len(), "Managed identity registry rebuilt");
        Ok(())
    }

    /// Register `set` as an owner of each of `identities`
    ///
    /// Returns the identities that had no owner before, whose checkout
    /// records the caller must seed. Under [`OverlapPolicy::Reject`] a claim
    /// on another set's member fails and nothing is registered.
    pub fn claim(
        &self,
        set: &str,
        identities: &[String],
        policy: OverlapPolicy,
    ) -> BrokerResult<Vec<String>> {
        let mut fresh = Vec::new();
        let mut claimed = Vec::new();

        for id in identities {
            let mut owners = self.owners.entry(id.clone()).or_default();
            let other = owners.iter().find(|owner| owner.as_str() != set).cloned();
            if let (Some(other), OverlapPolicy::Reject) = (&other, policy) {
                drop(owners);
                self.owners.remove_if(id, |_, owners| owners.is_empty());
                self.release(set, &claimed);
                return Err(BrokerError::validation(format!(
                    "identity '{id}' is already managed by library set '{other}'"
                )));
            }
            if owners.insert(set.to_string()) {
                claimed.push(id.clone());
            }
            if other.is_none() {
                fresh.push(id.clone());
            }
        }
        Ok(fresh)
    }

    /// Drop `set` as owner of `identities`
    pub fn release(&self, set: &str, identities: &[String]) {
        for id in identities {
            if let Some(mut owners) = self.owners.get_mut(id) {
                owners.remove(set);
            }
            self.owners.remove_if(id, |_, owners| owners.is_empty());
        }
    }

    /// Whether any set other than `set` manages `identity_id`
    pub fn shared_with_others(&self, identity_id: &str, set: &str) -> bool {
        self.owners
            .get(identity_id)
            .is_some_and(|owners| owners.iter().any(|owner| owner != set))
    }

    pub fn owners(&self, identity_id: &str) -> Vec<String> {
        self.owners
            .get(identity_id)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_managed(&self, identity_id: &str) -> bool {
        self.owners.contains_key(identity_id)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Library set operations
pub struct LibrarySetManager<'a> {
    ctx: &'a BrokerContext,
}

impl<'a> LibrarySetManager<'a> {
    pub(crate) fn new(ctx: &'a BrokerContext) -> Self {
        Self { ctx }
    }

    /// Create a set and seed every member as available
    ///
    /// Each member must exist upstream in the set's scope.
    pub async fn create(&self, set: LibrarySet) -> BrokerResult<LibrarySet> {
        set.validate()?;
        let _guard = self.ctx.set_locks.write(&set.name).await;

        if self.load(&set.name).await?.is_some() {
            return Err(BrokerError::validation(format!(
                "library set '{}' already exists",
                set.name
            )));
        }

        let managed = &self.ctx.managed;
        let fresh = managed.claim(&set.name, &set.member_identity_ids, self.ctx.config.overlap_policy)?;

        let registered: BrokerResult<()> = async {
            self.verify_members(&set.external_scope, &set.member_identity_ids)
                .await?;
            for id in &fresh {
                self.ctx.checkouts.seed_available(id).await?;
            }
            self.persist(&set).await
        }
        .await;

        if let Err(e) = registered {
            managed.release(&set.name, &set.member_identity_ids);
            return Err(e);
        }

        tracing::info!(
            set = %set.name,
            members = set.member_identity_ids.len(),
            "Library set created"
        );
        Ok(set)
    }

    pub async fn read(&self, name: &str) -> BrokerResult<LibrarySet> {
        let _guard = self.ctx.set_locks.read(name).await;
        self.require(name).await
    }

    /// Names of every set, sorted
    pub async fn list(&self) -> BrokerResult<Vec<String>> {
        Ok(self.ctx.store.list(keys::LIBRARY_PREFIX).await?)
    }

    /// Replace a set's definition
    ///
    /// Added members are verified upstream and seeded; removed members lose
    /// their checkout record and any outstanding key.
    pub async fn update(&self, set: LibrarySet) -> BrokerResult<LibrarySet> {
        set.validate()?;
        let retired = {
            let _guard = self.ctx.set_locks.write(&set.name).await;
            let old = self.require(&set.name).await?;

            let added: Vec<String> = set
                .member_identity_ids
                .iter()
                .filter(|id| !old.contains(id))
                .cloned()
                .collect();
            let removed: Vec<String> = old
                .member_identity_ids
                .iter()
                .filter(|id| !set.contains(id))
                .cloned()
                .collect();

            let managed = &self.ctx.managed;
            let fresh = managed.claim(&set.name, &added, self.ctx.config.overlap_policy)?;

            let to_verify = if old.external_scope == set.external_scope {
                added.clone()
            } else {
                set.member_identity_ids.clone()
            };
            let applied: BrokerResult<()> = async {
                self.verify_members(&set.external_scope, &to_verify).await?;
                for id in &fresh {
                    self.ctx.checkouts.seed_available(id).await?;
                }
                self.persist(&set).await
            }
            .await;
            if let Err(e) = applied {
                managed.release(&set.name, &added);
                return Err(e);
            }

            let retired = self.retire_members(&set.name, &removed).await?;
            tracing::info!(
                set = %set.name,
                added = added.len(),
                removed = removed.len(),
                "Library set updated"
            );
            retired
        };

        self.revoke_keys(&retired).await;
        Ok(set)
    }

    /// Delete a set, checking in every outstanding member first
    ///
    /// Keys of retired members are revoked even if removing the set record
    /// fails; the set is then left without member records and a retried
    /// delete finishes the job.
    pub async fn delete(&self, name: &str) -> BrokerResult<()> {
        let (retired, removed) = {
            let _guard = self.ctx.set_locks.write(name).await;
            let set = self.require(name).await?;
            let retired = self.retire_members(name, &set.member_identity_ids).await?;
            let removed = self.ctx.store.delete(&keys::library(name)).await;
            (retired, removed)
        };

        self.revoke_keys(&retired).await;
        removed?;
        tracing::info!(set = %name, "Library set deleted");
        Ok(())
    }

    /// Borrow the first available member and mint it a key
    ///
    /// Members are tried in stored order; there is no fairness across
    /// callers, so later members are only used while earlier ones are busy.
    /// The checkout record is written before the key is minted and rolled
    /// back if minting or recording the key fails. The set lock is not held
    /// while the key is minted; the record is re-checked before the key is
    /// recorded and before any rollback, so a check-in or retirement that
    /// happened in between wins.
    pub async fn check_out(
        &self,
        name: &str,
        requested_ttl: Duration,
        borrower: &Borrower,
    ) -> BrokerResult<CheckOutOutcome> {
        let (set, identity_id, claimed) = {
            let _guard = self.ctx.set_locks.write(name).await;
            let set = self.require(name).await?;

            let mut chosen = None;
            for id in &set.member_identity_ids {
                match self.ctx.checkouts.check_out(id, borrower).await {
                    Ok(claimed) => {
                        chosen = Some((id.clone(), claimed));
                        break;
                    }
                    Err(BrokerError::AlreadyCheckedOut { .. }) => continue,
                    Err(e) if e.is_not_found() => {
                        tracing::warn!(set = %name, identity_id = %id, "Member has no checkout record");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            match chosen {
                Some((id, claimed)) => (set, id, claimed),
                None => {
                    tracing::debug!(set = %name, "No identities available");
                    return Ok(CheckOutOutcome::NoneAvailable);
                }
            }
        };

        let lease_duration = set.lease_for(requested_ttl);
        match self.issue_key(&set, &identity_id, &claimed, lease_duration).await {
            Ok(lease) => {
                tracing::info!(
                    set = %name,
                    identity_id = %identity_id,
                    lease_secs = lease_duration.as_secs(),
                    "Identity checked out"
                );
                Ok(CheckOutOutcome::Granted(lease))
            }
            Err(e) => {
                tracing::warn!(set = %name, identity_id = %identity_id, error = %e, "Rolling back check-out");
                let _guard = self.ctx.set_locks.write(name).await;
                match self.ctx.checkouts.release(&identity_id, &claimed).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(
                            set = %name,
                            identity_id = %identity_id,
                            "Check-out already ended; nothing to roll back"
                        );
                    }
                    Err(rollback) => {
                        tracing::error!(
                            set = %name,
                            identity_id = %identity_id,
                            error = %rollback,
                            "Failed to roll back check-out; identity stays marked as borrowed"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Return identities to the pool; returns the ids checked in
    pub async fn check_in(&self, name: &str, request: CheckInRequest) -> BrokerResult<Vec<String>> {
        let (targets, retired) = {
            let _guard = self.ctx.set_locks.write(name).await;
            let set = self.require(name).await?;
            let enforce = set.enforce_borrower_check_in;
            let checkouts = &self.ctx.checkouts;

            let targets = if request.identities.is_empty() {
                let mut found = Vec::new();
                for id in &set.member_identity_ids {
                    let record = match checkouts.load_checkout(id).await {
                        Ok(record) => record,
                        Err(e) if e.is_not_found() => {
                            tracing::warn!(set = %name, identity_id = %id, "Member has no checkout record");
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    if !record.is_available
                        && may_check_in(&record, &request.requester, request.force, enforce)
                    {
                        found.push(id.clone());
                    }
                }
                if found.len() > 1 {
                    return Err(BrokerError::validation(format!(
                        "{} identities are checked out; name the ones to check in",
                        found.len()
                    )));
                }
                found
            } else {
                let mut targets: Vec<String> = Vec::new();
                for id in &request.identities {
                    if !set.contains(id) {
                        return Err(BrokerError::validation(format!(
                            "identity '{id}' is not a member of library set '{name}'"
                        )));
                    }
                    if !targets.contains(id) {
                        targets.push(id.clone());
                    }
                }
                targets
            };

            for id in &targets {
                let record = checkouts.load_checkout(id).await?;
                if !may_check_in(&record, &request.requester, request.force, enforce) {
                    return Err(BrokerError::Unauthorized {
                        identity_id: id.clone(),
                    });
                }
            }

            let mut retired = Vec::new();
            for id in &targets {
                if let Some(handle) = checkouts.check_in(id).await? {
                    retired.push(handle);
                }
            }
            (targets, retired)
        };

        self.revoke_keys(&retired).await;
        tracing::info!(set = %name, identities = ?targets, forced = request.force, "Identities checked in");
        Ok(targets)
    }

    /// Availability of every member, sorted by identity id
    ///
    /// A member without a checkout record is left out.
    pub async fn status(&self, name: &str) -> BrokerResult<Vec<MemberStatus>> {
        let _guard = self.ctx.set_locks.read(name).await;
        let set = self.require(name).await?;

        let mut members = Vec::with_capacity(set.member_identity_ids.len());
        for id in &set.member_identity_ids {
            let record = match self.ctx.checkouts.load_checkout(id).await {
                Ok(record) => record,
                Err(e) if e.is_not_found() => {
                    tracing::warn!(set = %name, identity_id = %id, "Member has no checkout record");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let borrowed = |field: &str| (!record.is_available).then(|| field.to_string());
            members.push(MemberStatus {
                identity_id: id.clone(),
                available: record.is_available,
                borrower_entity_id: borrowed(&record.borrower_entity_id),
                borrower_token: borrowed(&record.borrower_token),
                checked_out_at: record.checked_out_at,
            });
        }
        members.sort_by(|a, b| a.identity_id.cmp(&b.identity_id));
        Ok(members)
    }

    async fn issue_key(
        &self,
        set: &LibrarySet,
        identity_id: &str,
        claimed: &CheckOut,
        lease_duration: Duration,
    ) -> BrokerResult<Lease> {
        let client = self.ctx.admin_client()?;
        let ttl = (!lease_duration.is_zero()).then_some(lease_duration);
        let key = client.create_key(identity_id, ttl).await?;
        let issued_at = Utc::now();

        let handle = KeyHandle {
            identity_id: identity_id.to_string(),
            key_id: key.id.clone(),
            issued_at,
            expires_at: key.expires_at,
        };
        let recorded = {
            let _guard = self.ctx.set_locks.write(&set.name).await;
            self.record_key(&handle, claimed).await
        };
        if let Err(e) = recorded {
            checkout::revoke_key(Some(client.as_ref()), &handle).await;
            return Err(e);
        }

        Ok(Lease {
            set_name: set.name.clone(),
            identity_id: identity_id.to_string(),
            key_id: key.id,
            secret: key.secret,
            lease_duration,
            issued_at,
            expires_at: key.expires_at,
        })
    }

    /// Persist `handle` if the identity is still borrowed under `claimed`
    async fn record_key(&self, handle: &KeyHandle, claimed: &CheckOut) -> BrokerResult<()> {
        let checkouts = &self.ctx.checkouts;
        if !checkouts.still_held(&handle.identity_id, claimed).await? {
            return Err(BrokerError::CheckOutLost {
                identity_id: handle.identity_id.clone(),
            });
        }
        checkouts.put_key_handle(handle).await
    }

    async fn verify_members(&self, scope: &str, identities: &[String]) -> BrokerResult<()> {
        if identities.is_empty() {
            return Ok(());
        }
        let client = self.ctx.admin_client()?;
        for id in identities {
            match client.get_identity(id, scope).await {
                Ok(_) => {}
                Err(UpstreamError::NotFound(_)) => {
                    return Err(BrokerError::validation(format!(
                        "identity '{id}' does not exist in scope '{scope}'"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Stop managing `identities` for `set`; returns key handles to revoke
    async fn retire_members(&self, set: &str, identities: &[String]) -> BrokerResult<Vec<KeyHandle>> {
        let mut retired = Vec::new();
        for id in identities {
            if !self.ctx.managed.shared_with_others(id, set) {
                if let Some(handle) = self.ctx.checkouts.delete_checkout(id).await? {
                    retired.push(handle);
                }
            }
            self.ctx.managed.release(set, std::slice::from_ref(id));
        }
        Ok(retired)
    }

    async fn revoke_keys(&self, handles: &[KeyHandle]) {
        if handles.is_empty() {
            return;
        }
        let client: Option<Arc<dyn UpstreamClient>> = self.ctx.admin_client().ok();
        for handle in handles {
            checkout::revoke_key(client.as_deref(), handle).await;
        }
    }

    async fn load(&self, name: &str) -> BrokerResult<Option<LibrarySet>> {
        Ok(store::get_json(self.ctx.store.as_ref(), &keys::library(name)).await?)
    }

    async fn require(&self, name: &str) -> BrokerResult<LibrarySet> {
        self.load(name)
            .await?
            .ok_or_else(|| BrokerError::not_found(ResourceKind::LibrarySet, name))
    }

    async fn persist(&self, set: &LibrarySet) -> BrokerResult<()> {
        store::put_json(self.ctx.store.as_ref(), &keys::library(&set.name), set).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const HOUR: u64 = 3600;

    fn pool() -> LibrarySet {
        LibrarySet::new("pool", ["sa-a", "sa-b"], "proj")
    }

    #[rstest]
    #[case::zero_uses_default(0, HOUR, 24 * HOUR, HOUR)]
    #[case::shorter_request_wins(1800, HOUR, 24 * HOUR, 1800)]
    #[case::request_never_lengthens_default(2 * HOUR, HOUR, 24 * HOUR, HOUR)]
    #[case::clamped_to_max(48 * HOUR, 0, 24 * HOUR, 24 * HOUR)]
    #[case::unbounded_default_uses_max(0, 0, 24 * HOUR, 24 * HOUR)]
    #[case::unbounded_max_keeps_request(600, 0, 0, 600)]
    #[case::fully_unbounded(0, 0, 0, 0)]
    fn test_lease_for(
        #[case] requested: u64,
        #[case] default_lease: u64,
        #[case] max_lease: u64,
        #[case] expected: u64,
    ) {
        let set = pool().with_leases(
            Duration::from_secs(default_lease),
            Duration::from_secs(max_lease),
        );
        assert_eq!(
            set.lease_for(Duration::from_secs(requested)),
            Duration::from_secs(expected)
        );
    }

    #[rstest]
    #[case::empty_members(LibrarySet::new("pool", Vec::<String>::new(), "proj"))]
    #[case::empty_name(LibrarySet::new("", ["sa-a"], "proj"))]
    #[case::slash_in_name(LibrarySet::new("a/b", ["sa-a"], "proj"))]
    #[case::missing_scope(LibrarySet::new("pool", ["sa-a"], ""))]
    #[case::duplicate_member(LibrarySet::new("pool", ["sa-a", "sa-a"], "proj"))]
    #[case::default_over_max(pool().with_leases(Duration::from_secs(2 * HOUR), Duration::from_secs(HOUR)))]
    fn test_validate_rejects(#[case] set: LibrarySet) {
        assert!(matches!(set.validate(), Err(BrokerError::Validation(_))));
    }

    #[test]
    fn test_validate_accepts_unbounded_max() {
        let set = pool().with_leases(Duration::from_secs(HOUR), Duration::ZERO);
        set.validate().unwrap();
    }

    #[test]
    fn test_claim_rejects_overlap() {
        let managed = ManagedIdentities::new();
        let fresh = managed
            .claim("one", &["sa-a".into(), "sa-b".into()], OverlapPolicy::Reject)
            .unwrap();
        assert_eq!(fresh, vec!["sa-a", "sa-b"]);

        let err = managed
            .claim("two", &["sa-c".into(), "sa-b".into()], OverlapPolicy::Reject)
            .unwrap_err();
        assert!(err.to_string().contains("'one'"));
        assert!(!managed.is_managed("sa-c"), "partial claim must be undone");
    }

    #[test]
    fn test_claim_allows_overlap_without_reseeding() {
        let managed = ManagedIdentities::new();
        managed
            .claim("one", &["sa-a".into()], OverlapPolicy::Allow)
            .unwrap();
        let fresh = managed
            .claim("two", &["sa-a".into(), "sa-b".into()], OverlapPolicy::Allow)
            .unwrap();

        assert_eq!(fresh, vec!["sa-b"]);
        assert_eq!(managed.owners("sa-a"), vec!["one", "two"]);
        assert!(managed.shared_with_others("sa-a", "one"));
    }

    #[test]
    fn test_release_prunes_empty_entries() {
        let managed = ManagedIdentities::new();
        managed
            .claim("one", &["sa-a".into()], OverlapPolicy::Reject)
            .unwrap();
        managed.release("one", &["sa-a".into()]);
        assert!(managed.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_from_store() {
        let store = crate::store::MemoryStore::new();
        store::put_json(&*store, &keys::library("pool"), &pool())
            .await
            .unwrap();

        let managed = ManagedIdentities::new();
        managed
            .claim("stale", &["sa-z".into()], OverlapPolicy::Reject)
            .unwrap();
        managed.rebuild(&*store).await.unwrap();

        assert_eq!(managed.len(), 2);
        assert_eq!(managed.owners("sa-a"), vec!["pool"]);
        assert!(!managed.is_managed("sa-z"));
    }
}
