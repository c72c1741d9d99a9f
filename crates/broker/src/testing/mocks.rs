use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{StoreError, UpstreamError};
use crate::rotation::scheduler::due_after;
use crate::secret::SecretString;
use crate::store::{DurableStore, MemoryStore};
use crate::upstream::{
    ApiKey, Identity, IssuedAdminCredential, UpstreamClient, UpstreamConnector,
};

#[derive(Debug, Clone)]
struct MockKey {
    identity_id: String,
    secret: String,
}

#[derive(Default)]
struct MockState {
    identities: DashMap<String, Identity>,
    keys: DashMap<String, MockKey>,
    admin: DashMap<String, String>,
    next_id: AtomicU64,
    create_key_failures: AtomicU32,
    create_admin_failures: AtomicU32,
    fail_validation: AtomicBool,
    fail_admin_revocation: AtomicBool,
    fail_key_deletion: AtomicBool,
    create_key_delay: Mutex<Option<Duration>>,
    calls: DashMap<&'static str, u32>,
}

/// In-memory upstream shared by every client it hands out
#[derive(Clone, Default)]
pub struct MockUpstream {
    state: Arc<MockState>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity in `scope`
    pub fn add_identity(&self, id: &str, scope: &str) -> Identity {
        let identity = Identity {
            id: id.to_string(),
            name: id.to_string(),
            scope: scope.to_string(),
        };
        self.state.identities.insert(id.to_string(), identity.clone());
        identity
    }

    /// Register an admin credential as live; returns its value
    pub fn seed_admin_credential(&self, external_id: &str) -> SecretString {
        let value = format!("admin-secret-{external_id}");
        self.state.admin.insert(external_id.to_string(), value.clone());
        SecretString::new(value)
    }

    pub fn connector(&self) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            upstream: self.clone(),
        })
    }

    /// Fail the next `times` key creations with a transient error
    pub fn fail_next_create_key(&self, times: u32) {
        self.state.create_key_failures.store(times, Ordering::SeqCst);
    }

    /// Fail the next `times` admin credential creations with a transient error
    pub fn fail_next_admin_create(&self, times: u32) {
        self.state.create_admin_failures.store(times, Ordering::SeqCst);
    }

    /// Make every connectivity check fail until reset
    pub fn fail_validation(&self, fail: bool) {
        self.state.fail_validation.store(fail, Ordering::SeqCst);
    }

    /// Make admin credential revocation fail until reset
    pub fn fail_admin_revocation(&self, fail: bool) {
        self.state.fail_admin_revocation.store(fail, Ordering::SeqCst);
    }

    /// Make key deletion fail until reset
    pub fn fail_key_deletion(&self, fail: bool) {
        self.state.fail_key_deletion.store(fail, Ordering::SeqCst);
    }

    /// Delay every key creation, to widen race windows
    pub fn with_create_key_delay(self, delay: Duration) -> Self {
        *self.state.create_key_delay.lock() = Some(delay);
        self
    }

    /// Number of calls made to an upstream operation, by method name
    pub fn calls(&self, operation: &str) -> u32 {
        self.state.calls.get(operation).map_or(0, |count| *count)
    }

    /// Keys currently live for an identity
    pub fn live_keys_for(&self, identity_id: &str) -> usize {
        self.state
            .keys
            .iter()
            .filter(|entry| entry.value().identity_id == identity_id)
            .count()
    }

    pub fn has_key(&self, key_id: &str) -> bool {
        self.state.keys.contains_key(key_id)
    }

    pub fn key_count(&self) -> usize {
        self.state.keys.len()
    }

    pub fn has_identity(&self, identity_id: &str) -> bool {
        self.state.identities.contains_key(identity_id)
    }

    /// Live admin credential ids, sorted
    pub fn admin_credential_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .admin
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_admin_live(&self, external_id: &str) -> bool {
        self.state.admin.contains_key(external_id)
    }

    fn record(&self, operation: &'static str) {
        *self.state.calls.entry(operation).or_insert(0) += 1;
    }

    fn next_id(&self) -> u64 {
        self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn mint_key(&self, identity_id: &str, ttl: Option<Duration>) -> ApiKey {
        let n = self.next_id();
        let id = format!("key-{n}");
        let secret = format!("key-secret-{n}");
        self.state.keys.insert(
            id.clone(),
            MockKey {
                identity_id: identity_id.to_string(),
                secret: secret.clone(),
            },
        );
        ApiKey {
            id,
            identity_id: identity_id.to_string(),
            secret: SecretString::new(secret),
            expires_at: ttl.map(|ttl| due_after(Utc::now(), ttl)),
        }
    }

    fn is_live_admin(&self, credential: &str) -> bool {
        self.state.admin.iter().any(|entry| entry.value() == credential)
    }

    fn is_live_key(&self, credential: &str) -> bool {
        self.state.keys.iter().any(|entry| entry.value().secret == credential)
    }
}

/// Client bound to one credential of a [`MockUpstream`]
///
/// Management calls require a live admin credential; connectivity checks
/// accept any live admin credential or key.
pub struct MockClient {
    upstream: MockUpstream,
    credential: String,
}

impl MockClient {
    fn authorize(&self) -> Result<(), UpstreamError> {
        if self.upstream.is_live_admin(&self.credential) {
            Ok(())
        } else {
            Err(UpstreamError::Unauthenticated(
                "credential is not a live admin credential".into(),
            ))
        }
    }
}

#[async_trait]
impl UpstreamClient for MockClient {
    async fn create_identity(
        &self,
        scope: &str,
        name: &str,
    ) -> Result<(Identity, ApiKey), UpstreamError> {
        self.upstream.record("create_identity");
        self.authorize()?;
        let id = format!("{name}-{}", self.upstream.next_id());
        let identity = self.upstream.add_identity(&id, scope);
        let key = self.upstream.mint_key(&id, None);
        Ok((identity, key))
    }

    async fn delete_identity(&self, identity_id: &str, _scope: &str) -> Result<(), UpstreamError> {
        self.upstream.record("delete_identity");
        self.authorize()?;
        let state = &self.upstream.state;
        state
            .identities
            .remove(identity_id)
            .ok_or_else(|| UpstreamError::NotFound(identity_id.to_string()))?;
        state.keys.retain(|_, key| key.identity_id != identity_id);
        Ok(())
    }

    async fn create_key(
        &self,
        identity_id: &str,
        ttl: Option<Duration>,
    ) -> Result<ApiKey, UpstreamError> {
        self.upstream.record("create_key");
        let delay = *self.upstream.state.create_key_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.authorize()?;
        if MockUpstream::take_failure(&self.upstream.state.create_key_failures) {
            return Err(UpstreamError::request("create_key", "injected failure"));
        }
        if !self.upstream.has_identity(identity_id) {
            return Err(UpstreamError::NotFound(identity_id.to_string()));
        }
        Ok(self.upstream.mint_key(identity_id, ttl))
    }

    async fn delete_key(&self, key_id: &str) -> Result<(), UpstreamError> {
        self.upstream.record("delete_key");
        self.authorize()?;
        if self.upstream.state.fail_key_deletion.load(Ordering::SeqCst) {
            return Err(UpstreamError::request("delete_key", "injected failure"));
        }
        self.upstream
            .state
            .keys
            .remove(key_id)
            .map(|_| ())
            .ok_or_else(|| UpstreamError::NotFound(key_id.to_string()))
    }

    async fn get_identity(&self, identity_id: &str, scope: &str) -> Result<Identity, UpstreamError> {
        self.upstream.record("get_identity");
        self.authorize()?;
        self.upstream
            .state
            .identities
            .get(identity_id)
            .filter(|identity| identity.scope == scope)
            .map(|identity| identity.clone())
            .ok_or_else(|| UpstreamError::NotFound(identity_id.to_string()))
    }

    async fn list_identities(&self, scope: &str) -> Result<Vec<Identity>, UpstreamError> {
        self.upstream.record("list_identities");
        self.authorize()?;
        let mut identities: Vec<Identity> = self
            .upstream
            .state
            .identities
            .iter()
            .filter(|entry| entry.value().scope == scope)
            .map(|entry| entry.value().clone())
            .collect();
        identities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(identities)
    }

    async fn create_admin_credential(
        &self,
        name: &str,
    ) -> Result<IssuedAdminCredential, UpstreamError> {
        self.upstream.record("create_admin_credential");
        self.authorize()?;
        if MockUpstream::take_failure(&self.upstream.state.create_admin_failures) {
            return Err(UpstreamError::request(
                "create_admin_credential",
                "injected failure",
            ));
        }
        let external_id = format!("{name}#{}", self.upstream.next_id());
        let value = self.upstream.seed_admin_credential(&external_id);
        Ok(IssuedAdminCredential { external_id, value })
    }

    async fn revoke_admin_credential(&self, external_id: &str) -> Result<(), UpstreamError> {
        self.upstream.record("revoke_admin_credential");
        self.authorize()?;
        if self.upstream.state.fail_admin_revocation.load(Ordering::SeqCst) {
            return Err(UpstreamError::request(
                "revoke_admin_credential",
                "injected failure",
            ));
        }
        self.upstream
            .state
            .admin
            .remove(external_id)
            .map(|_| ())
            .ok_or_else(|| UpstreamError::NotFound(external_id.to_string()))
    }

    async fn validate_connectivity(&self) -> Result<(), UpstreamError> {
        self.upstream.record("validate_connectivity");
        if self.upstream.state.fail_validation.load(Ordering::SeqCst) {
            return Err(UpstreamError::Unauthenticated("injected failure".into()));
        }
        if self.upstream.is_live_admin(&self.credential) || self.upstream.is_live_key(&self.credential) {
            Ok(())
        } else {
            Err(UpstreamError::Unauthenticated("unknown credential".into()))
        }
    }
}

/// Hands out [`MockClient`]s over one [`MockUpstream`]
pub struct MockConnector {
    upstream: MockUpstream,
}

impl UpstreamConnector for MockConnector {
    fn connect(&self, credential: &SecretString) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
        Ok(Arc::new(MockClient {
            upstream: self.upstream.clone(),
            credential: credential.expose_secret(str::to_string),
        }))
    }
}

/// [`MemoryStore`] whose writes or deletes under a prefix can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_prefix: Mutex<Option<String>>,
    failing_delete_prefix: Mutex<Option<String>>,
    put_count: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every put whose key starts with `prefix`
    pub fn fail_puts_under(&self, prefix: &str) {
        *self.failing_prefix.lock() = Some(prefix.to_string());
    }

    /// Fail every delete whose key starts with `prefix`
    pub fn fail_deletes_under(&self, prefix: &str) {
        *self.failing_delete_prefix.lock() = Some(prefix.to_string());
    }

    pub fn heal(&self) {
        *self.failing_prefix.lock() = None;
        *self.failing_delete_prefix.lock() = None;
    }

    pub fn put_count(&self) -> u32 {
        self.put_count.load(Ordering::SeqCst)
    }

    fn matches(prefix: &Mutex<Option<String>>, key: &str) -> bool {
        prefix
            .lock()
            .as_deref()
            .is_some_and(|prefix| key.starts_with(prefix))
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.put_count.fetch_add(1, Ordering::SeqCst);
        if Self::matches(&self.failing_prefix, key) {
            return Err(StoreError::backend(key, "injected failure"));
        }
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if Self::matches(&self.failing_delete_prefix, key) {
            return Err(StoreError::backend(key, "injected failure"));
        }
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(prefix).await
    }
}
