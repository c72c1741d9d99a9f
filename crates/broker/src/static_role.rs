//! Static roles: one fixed identity whose key is rotated on a schedule
//!
//! Rotation runs the swap protocol under the role's lock. Revoking the
//! retired key is best effort; once the new key is committed it is the
//! role's credential regardless.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::BrokerContext;
use crate::error::{BrokerError, BrokerResult, ResourceKind, UpstreamError};
use crate::rotation::scheduler::due_after;
use crate::rotation::{RevocationPolicy, RotationKey, SwapTarget};
use crate::secret::{self, SecretString};
use crate::store::{self, keys};
use crate::upstream::{ApiKey, UpstreamClient};

/// Persisted static role and its current key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRoleCredential {
    pub role_name: String,
    pub bound_identity_id: String,
    pub external_scope: String,
    #[serde(with = "secret::persisted")]
    pub credential_value: SecretString,
    /// Upstream id of the current key
    pub key_id: String,
    pub last_rotated_at: DateTime<Utc>,
    /// Zero disables scheduled rotation
    #[serde(with = "humantime_serde")]
    pub rotation_period: Duration,
    /// The identity was created for this role and is deleted with it
    #[serde(default)]
    pub owns_identity: bool,
}

impl StaticRoleCredential {
    pub fn next_rotation_at(&self) -> Option<DateTime<Utc>> {
        (!self.rotation_period.is_zero()).then(|| due_after(self.last_rotated_at, self.rotation_period))
    }
}

/// Input for [`StaticRoleManager::create`]
#[derive(Debug, Clone)]
pub struct StaticRoleDefinition {
    pub role_name: String,
    /// Existing identity to bind; `None` creates a dedicated one
    pub bound_identity_id: Option<String>,
    pub external_scope: String,
    pub rotation_period: Duration,
}

impl StaticRoleDefinition {
    /// Role bound to an existing identity
    pub fn bound(
        role_name: impl Into<String>,
        identity_id: impl Into<String>,
        external_scope: impl Into<String>,
    ) -> Self {
        Self {
            role_name: role_name.into(),
            bound_identity_id: Some(identity_id.into()),
            external_scope: external_scope.into(),
            rotation_period: Duration::ZERO,
        }
    }

    /// Role with an identity of its own, created upstream
    pub fn dedicated(role_name: impl Into<String>, external_scope: impl Into<String>) -> Self {
        Self {
            role_name: role_name.into(),
            bound_identity_id: None,
            external_scope: external_scope.into(),
            rotation_period: Duration::ZERO,
        }
    }

    pub fn rotate_every(mut self, period: Duration) -> Self {
        self.rotation_period = period;
        self
    }

    fn validate(&self) -> BrokerResult<()> {
        if self.role_name.is_empty() || self.role_name.contains('/') {
            return Err(BrokerError::validation(
                "role name must be non-empty and must not contain '/'",
            ));
        }
        if self.external_scope.is_empty() {
            return Err(BrokerError::validation("external_scope is required"));
        }
        if self.bound_identity_id.as_deref() == Some("") {
            return Err(BrokerError::validation("bound identity id must not be empty"));
        }
        Ok(())
    }
}

/// Static role operations
pub struct StaticRoleManager<'a> {
    ctx: &'a BrokerContext,
}

impl<'a> StaticRoleManager<'a> {
    pub(crate) fn new(ctx: &'a BrokerContext) -> Self {
        Self { ctx }
    }

    /// Create a role, mint its first key and schedule its rotation
    pub async fn create(
        &self,
        definition: StaticRoleDefinition,
    ) -> BrokerResult<StaticRoleCredential> {
        definition.validate()?;
        let _guard = self.ctx.role_locks.write(&definition.role_name).await;

        if self.load(&definition.role_name).await?.is_some() {
            return Err(BrokerError::validation(format!(
                "static role '{}' already exists",
                definition.role_name
            )));
        }

        let client = self.ctx.admin_client()?;
        let (identity_id, key, owns_identity) = match &definition.bound_identity_id {
            Some(identity_id) => {
                match client.get_identity(identity_id, &definition.external_scope).await {
                    Ok(_) => {}
                    Err(UpstreamError::NotFound(_)) => {
                        return Err(BrokerError::validation(format!(
                            "identity '{identity_id}' does not exist in scope '{}'",
                            definition.external_scope
                        )));
                    }
                    Err(e) => return Err(e.into()),
                }
                let key = client.create_key(identity_id, None).await?;
                (identity_id.clone(), key, false)
            }
            None => {
                let (identity, key) = client
                    .create_identity(&definition.external_scope, &definition.role_name)
                    .await?;
                (identity.id, key, true)
            }
        };

        let record = StaticRoleCredential {
            role_name: definition.role_name,
            bound_identity_id: identity_id,
            external_scope: definition.external_scope,
            credential_value: key.secret,
            key_id: key.id,
            last_rotated_at: Utc::now(),
            rotation_period: definition.rotation_period,
            owns_identity,
        };
        if let Err(e) = self.persist(&record).await {
            release_upstream(client.as_ref(), &record).await;
            return Err(e);
        }
        self.reschedule(&record).await;

        tracing::info!(
            role = %record.role_name,
            identity_id = %record.bound_identity_id,
            rotation_period_secs = record.rotation_period.as_secs(),
            "Static role created"
        );
        Ok(record)
    }

    /// Current credential of a role
    pub async fn read(&self, name: &str) -> BrokerResult<StaticRoleCredential> {
        let _guard = self.ctx.role_locks.read(name).await;
        self.require(name).await
    }

    /// Names of every role, sorted
    pub async fn list(&self) -> BrokerResult<Vec<String>> {
        Ok(self.ctx.store.list(keys::STATIC_ROLE_PREFIX).await?)
    }

    /// Delete a role; its key (and owned identity) are removed best effort
    pub async fn delete(&self, name: &str) -> BrokerResult<()> {
        let _guard = self.ctx.role_locks.write(name).await;
        let record = self.require(name).await?;

        self.ctx
            .scheduler
            .unschedule(RotationKey::StaticRole(name.to_string()))
            .await;
        self.ctx.store.delete(&keys::static_role(name)).await?;

        match self.ctx.admin_client() {
            Ok(client) => release_upstream(client.as_ref(), &record).await,
            Err(_) => tracing::warn!(role = %name, "No admin credential; role key left to the operator"),
        }
        tracing::info!(role = %name, "Static role deleted");
        Ok(())
    }

    /// Rotate a role's key now; returns the rotation time
    pub async fn rotate(&self, name: &str) -> BrokerResult<DateTime<Utc>> {
        let _guard = self.ctx.role_locks.write(name).await;
        let current = self.require(name).await?;

        let rotated = self.swap(current).await?;
        self.reschedule(&rotated).await;
        Ok(rotated.last_rotated_at)
    }

    /// Scheduler entry point; `None` once the role is gone or unscheduled
    pub(crate) async fn rotate_scheduled(&self, name: &str) -> BrokerResult<Option<Duration>> {
        let _guard = self.ctx.role_locks.write(name).await;
        let Some(current) = self.load(name).await? else {
            return Ok(None);
        };
        if current.rotation_period.is_zero() {
            return Ok(None);
        }

        let rotated = self.swap(current).await?;
        Ok(Some(rotated.rotation_period))
    }

    pub(crate) async fn load(&self, name: &str) -> BrokerResult<Option<StaticRoleCredential>> {
        Ok(store::get_json(self.ctx.store.as_ref(), &keys::static_role(name)).await?)
    }

    async fn require(&self, name: &str) -> BrokerResult<StaticRoleCredential> {
        self.load(name)
            .await?
            .ok_or_else(|| BrokerError::not_found(ResourceKind::StaticRole, name))
    }

    async fn persist(&self, record: &StaticRoleCredential) -> BrokerResult<()> {
        store::put_json(
            self.ctx.store.as_ref(),
            &keys::static_role(&record.role_name),
            record,
        )
        .await?;
        Ok(())
    }

    async fn swap(&self, current: StaticRoleCredential) -> BrokerResult<StaticRoleCredential> {
        let target = StaticRoleSwap {
            manager: self,
            authority: self.ctx.admin_client()?,
            current,
        };
        let report = self.ctx.swap.run(&target).await?;
        Ok(report.committed)
    }

    async fn reschedule(&self, record: &StaticRoleCredential) {
        let key = RotationKey::StaticRole(record.role_name.clone());
        match record.next_rotation_at() {
            Some(due_at) => self.ctx.scheduler.schedule(key, due_at.max(Utc::now())).await,
            None => self.ctx.scheduler.unschedule(key).await,
        }
    }
}

async fn release_upstream(client: &dyn UpstreamClient, record: &StaticRoleCredential) {
    let released = if record.owns_identity {
        client
            .delete_identity(&record.bound_identity_id, &record.external_scope)
            .await
    } else {
        client.delete_key(&record.key_id).await
    };
    if let Err(e) = released {
        tracing::warn!(
            role = %record.role_name,
            identity_id = %record.bound_identity_id,
            error = %e,
            "Failed to release static role credential upstream"
        );
    }
}

struct StaticRoleSwap<'m, 'a> {
    manager: &'m StaticRoleManager<'a>,
    /// Admin client; role keys cannot manage keys themselves
    authority: Arc<dyn UpstreamClient>,
    current: StaticRoleCredential,
}

#[async_trait]
impl<'m, 'a> SwapTarget for StaticRoleSwap<'m, 'a> {
    type Credential = ApiKey;
    type Committed = StaticRoleCredential;

    fn label(&self) -> String {
        format!("static role '{}'", self.current.role_name)
    }

    fn revocation_policy(&self) -> RevocationPolicy {
        RevocationPolicy::Tolerated
    }

    async fn create(&self) -> Result<ApiKey, UpstreamError> {
        self.authority
            .create_key(&self.current.bound_identity_id, None)
            .await
    }

    async fn validate(&self, candidate: &ApiKey) -> BrokerResult<()> {
        let client = self.manager.ctx.connector.connect(&candidate.secret)?;
        client.validate_connectivity().await?;
        Ok(())
    }

    async fn commit(&self, candidate: ApiKey) -> BrokerResult<StaticRoleCredential> {
        let record = StaticRoleCredential {
            credential_value: candidate.secret,
            key_id: candidate.id,
            last_rotated_at: Utc::now(),
            ..self.current.clone()
        };
        self.manager.persist(&record).await?;
        tracing::info!(
            role = %record.role_name,
            key_id = %record.key_id,
            retired = %self.current.key_id,
            "Static role key committed"
        );
        Ok(record)
    }

    async fn revoke(&self, _committed: &StaticRoleCredential) -> BrokerResult<()> {
        match self.authority.delete_key(&self.current.key_id).await {
            Ok(()) | Err(UpstreamError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
