//! The administrative credential
//!
//! One credential manages every identity and key. It is rotated with the
//! swap protocol under a single broker-wide lock. A retired credential that
//! could not be revoked stays in `pending_revocations`. The next rotation
//! revokes it before minting anything, and fails without minting while any
//! stay live, so at most one retired credential is ever outstanding.

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
use crate::upstream::{IssuedAdminCredential, UpstreamClient};

/// Persisted admin credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminCredential {
    #[serde(with = "secret::persisted")]
    pub value: SecretString,
    /// Upstream id; empty for an operator-supplied credential
    pub external_id: String,
    pub last_rotated_at: DateTime<Utc>,
    /// Zero disables scheduled rotation
    #[serde(with = "humantime_serde")]
    pub rotation_period: Duration,
    pub disable_automated_rotation: bool,
    /// Retired credentials still live upstream
    #[serde(default)]
    pub pending_revocations: Vec<String>,
}

impl AdminCredential {
    pub fn automated_rotation_enabled(&self) -> bool {
        !self.rotation_period.is_zero() && !self.disable_automated_rotation
    }

    /// When the next scheduled rotation is due
    pub fn next_rotation_at(&self) -> Option<DateTime<Utc>> {
        self.automated_rotation_enabled()
            .then(|| due_after(self.last_rotated_at, self.rotation_period))
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.next_rotation_at().is_some_and(|due| now > due)
    }
}

/// Operator input for [`AdminCredentialManager::configure`]
#[derive(Debug, Clone)]
pub struct AdminCredentialConfig {
    pub value: SecretString,
    pub external_id: String,
    pub rotation_period: Duration,
    pub disable_automated_rotation: bool,
}

impl AdminCredentialConfig {
    pub fn new(value: SecretString, external_id: impl Into<String>) -> Self {
        Self {
            value,
            external_id: external_id.into(),
            rotation_period: Duration::ZERO,
            disable_automated_rotation: false,
        }
    }

    pub fn rotate_every(mut self, period: Duration) -> Self {
        self.rotation_period = period;
        self
    }

    pub fn without_automated_rotation(mut self) -> Self {
        self.disable_automated_rotation = true;
        self
    }
}

/// Admin credential without its secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminCredentialView {
    pub external_id: String,
    pub last_rotated_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub rotation_period: Duration,
    pub disable_automated_rotation: bool,
    pub next_rotation_at: Option<DateTime<Utc>>,
    pub pending_revocations: Vec<String>,
}

impl From<&AdminCredential> for AdminCredentialView {
    fn from(credential: &AdminCredential) -> Self {
        Self {
            external_id: credential.external_id.clone(),
            last_rotated_at: credential.last_rotated_at,
            rotation_period: credential.rotation_period,
            disable_automated_rotation: credential.disable_automated_rotation,
            next_rotation_at: credential.next_rotation_at(),
            pending_revocations: credential.pending_revocations.clone(),
        }
    }
}

/// Outcome of a manual rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminRotation {
    Rotated { rotated_at: DateTime<Utc> },
    /// No admin credential has been configured
    NotConfigured,
}

/// Admin credential operations
pub struct AdminCredentialManager<'a> {
    ctx: &'a BrokerContext,
}

impl<'a> AdminCredentialManager<'a> {
    pub(crate) fn new(ctx: &'a BrokerContext) -> Self {
        Self { ctx }
    }

    /// Install an operator-supplied credential and (re)schedule its rotation
    ///
    /// Outstanding revocations of an earlier credential are kept.
    pub async fn configure(&self, config: AdminCredentialConfig) -> BrokerResult<AdminCredentialView> {
        let _guard = self.ctx.admin_lock.lock().await;
        let client = self.ctx.connector.connect(&config.value)?;
        let existing = self.load().await?;

        let last_rotated_at = existing
            .as_ref()
            .filter(|current| {
                !config.external_id.is_empty() && current.external_id == config.external_id
            })
            .map_or_else(Utc::now, |current| current.last_rotated_at);

        let record = AdminCredential {
            value: config.value,
            external_id: config.external_id,
            last_rotated_at,
            rotation_period: config.rotation_period,
            disable_automated_rotation: config.disable_automated_rotation,
            pending_revocations: existing
                .map(|current| current.pending_revocations)
                .unwrap_or_default(),
        };
        self.persist(&record).await?;
        self.ctx.install_client(client, &record.external_id);
        self.reschedule(&record).await;

        tracing::info!(
            external_id = %record.external_id,
            rotation_period_secs = record.rotation_period.as_secs(),
            automated = record.automated_rotation_enabled(),
            "Admin credential configured"
        );
        Ok(AdminCredentialView::from(&record))
    }

    /// Redacted view of the current credential
    pub async fn read(&self) -> BrokerResult<AdminCredentialView> {
        self.load()
            .await?
            .map(|record| AdminCredentialView::from(&record))
            .ok_or_else(not_configured)
    }

    /// Rotate now, whatever the schedule says
    pub async fn rotate(&self) -> BrokerResult<AdminRotation> {
        let _guard = self.ctx.admin_lock.lock().await;
        let Some(current) = self.load().await? else {
            return Ok(AdminRotation::NotConfigured);
        };

        let rotated = self.swap(current).await?;
        self.reschedule(&rotated).await;
        Ok(AdminRotation::Rotated {
            rotated_at: rotated.last_rotated_at,
        })
    }

    /// Scheduler entry point; `None` once automated rotation is off
    pub(crate) async fn rotate_scheduled(&self) -> BrokerResult<Option<Duration>> {
        let _guard = self.ctx.admin_lock.lock().await;
        let Some(current) = self.load().await? else {
            return Ok(None);
        };
        if !current.automated_rotation_enabled() {
            return Ok(None);
        }

        let rotated = self.swap(current).await?;
        Ok(Some(rotated.rotation_period))
    }

    /// Rotate synchronously if the credential is past due at `now`
    pub(crate) async fn rotate_if_overdue(&self, now: DateTime<Utc>) -> BrokerResult<bool> {
        let _guard = self.ctx.admin_lock.lock().await;
        let Some(current) = self.load().await? else {
            return Ok(false);
        };
        if !current.is_overdue(now) {
            return Ok(false);
        }

        tracing::warn!(
            external_id = %current.external_id,
            last_rotated_at = %current.last_rotated_at,
            "Admin credential is overdue for rotation; rotating before serving traffic"
        );
        self.swap(current).await?;
        Ok(true)
    }

    /// Install a client for the stored credential, if any
    pub(crate) async fn activate_stored(&self) -> BrokerResult<Option<AdminCredential>> {
        let record = self.load().await?;
        if let Some(record) = &record {
            let client = self.ctx.connector.connect(&record.value)?;
            self.ctx.install_client(client, &record.external_id);
        }
        Ok(record)
    }

    pub(crate) async fn load(&self) -> BrokerResult<Option<AdminCredential>> {
        Ok(store::get_json(self.ctx.store.as_ref(), keys::ADMIN_CREDENTIAL).await?)
    }

    async fn persist(&self, record: &AdminCredential) -> BrokerResult<()> {
        store::put_json(self.ctx.store.as_ref(), keys::ADMIN_CREDENTIAL, record).await?;
        Ok(())
    }

    async fn swap(&self, current: AdminCredential) -> BrokerResult<AdminCredential> {
        let authority = self.ctx.admin_client()?;
        let current = self.clear_pending(authority.as_ref(), current).await?;
        let target = AdminSwap {
            manager: self,
            authority,
            current,
        };
        let report = self.ctx.swap.run(&target).await?;
        Ok(report.committed)
    }

    /// Revoke credentials left live by earlier rotations
    async fn clear_pending(
        &self,
        client: &dyn UpstreamClient,
        mut current: AdminCredential,
    ) -> BrokerResult<AdminCredential> {
        if current.pending_revocations.is_empty() {
            return Ok(current);
        }

        let (remaining, last_error) = revoke_retired(client, &current.pending_revocations).await;
        if remaining != current.pending_revocations {
            current.pending_revocations = remaining;
            self.persist(&current).await?;
        }

        match last_error {
            Some(e) => {
                tracing::warn!(
                    pending = ?current.pending_revocations,
                    "Retired admin credentials still live; not minting another"
                );
                Err(e.into())
            }
            None => Ok(current),
        }
    }

    async fn reschedule(&self, record: &AdminCredential) {
        match record.next_rotation_at() {
            Some(due_at) => {
                self.ctx
                    .scheduler
                    .schedule(RotationKey::Admin, due_at.max(Utc::now()))
                    .await;
            }
            None => self.ctx.scheduler.unschedule(RotationKey::Admin).await,
        }
    }
}

fn not_configured() -> BrokerError {
    BrokerError::not_found(ResourceKind::AdminCredential, "admin")
}

/// Revoke each of `retired`; returns the ids still live and the last error
async fn revoke_retired(
    client: &dyn UpstreamClient,
    retired: &[String],
) -> (Vec<String>, Option<UpstreamError>) {
    let mut remaining = Vec::new();
    let mut last_error = None;
    for external_id in retired {
        match client.revoke_admin_credential(external_id).await {
            Ok(()) | Err(UpstreamError::NotFound(_)) => {
                tracing::info!(external_id = %external_id, "Retired admin credential revoked");
            }
            Err(e) => {
                tracing::error!(
                    external_id = %external_id,
                    error = %e,
                    "Failed to revoke retired admin credential; it is still live"
                );
                remaining.push(external_id.clone());
                last_error = Some(e);
            }
        }
    }
    (remaining, last_error)
}

struct AdminSwap<'m, 'a> {
    manager: &'m AdminCredentialManager<'a>,
    authority: Arc<dyn UpstreamClient>,
    current: AdminCredential,
}

#[async_trait]
impl<'m, 'a> SwapTarget for AdminSwap<'m, 'a> {
    type Credential = IssuedAdminCredential;
    type Committed = AdminCredential;

    fn label(&self) -> String {
        "admin credential".to_string()
    }

    fn revocation_policy(&self) -> RevocationPolicy {
        RevocationPolicy::Fatal
    }

    async fn create(&self) -> Result<IssuedAdminCredential, UpstreamError> {
        let name = format!(
            "{}-{}",
            self.manager.ctx.config.admin_credential_prefix,
            Utc::now().timestamp()
        );
        self.authority.create_admin_credential(&name).await
    }

    async fn validate(&self, candidate: &IssuedAdminCredential) -> BrokerResult<()> {
        let client = self.manager.ctx.connector.connect(&candidate.value)?;
        client.validate_connectivity().await?;
        Ok(())
    }

    async fn commit(&self, candidate: IssuedAdminCredential) -> BrokerResult<AdminCredential> {
        let client = self.manager.ctx.connector.connect(&candidate.value)?;

        let mut pending_revocations = self.current.pending_revocations.clone();
        let retired = &self.current.external_id;
        if !retired.is_empty() && !pending_revocations.contains(retired) {
            pending_revocations.push(retired.clone());
        }

        let record = AdminCredential {
            value: candidate.value,
            external_id: candidate.external_id,
            last_rotated_at: Utc::now(),
            rotation_period: self.current.rotation_period,
            disable_automated_rotation: self.current.disable_automated_rotation,
            pending_revocations,
        };
        self.manager.persist(&record).await?;
        self.manager.ctx.install_client(client, &record.external_id);

        tracing::info!(
            external_id = %record.external_id,
            retired = %self.current.external_id,
            "Admin credential committed"
        );
        Ok(record)
    }

    async fn revoke(&self, committed: &AdminCredential) -> BrokerResult<()> {
        if committed.pending_revocations.is_empty() {
            return Ok(());
        }

        let client = self.manager.ctx.connector.connect(&committed.value)?;
        let (remaining, last_error) =
            revoke_retired(client.as_ref(), &committed.pending_revocations).await;

        if remaining != committed.pending_revocations {
            let mut record = committed.clone();
            record.pending_revocations = remaining;
            self.manager.persist(&record).await?;
        }

        match last_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
