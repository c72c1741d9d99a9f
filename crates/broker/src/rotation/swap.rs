//! Credential swap protocol
//!
//! Replaces a credential without a window where none is valid:
//! create the replacement with the current credential's authority, prove
//! it works, make it authoritative, then revoke the retired one.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::retry::{RetryPolicy, retry_with_backoff};
use super::state::SwapState;
use crate::error::{BrokerError, BrokerResult, UpstreamError};

/// Unique identifier for one swap attempt, used to correlate log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RotationId(Uuid);

impl RotationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RotationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RotationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a failed revocation means for the swap as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationPolicy {
    /// The swap fails and is retried; the retired credential may still be live
    Fatal,
    /// Logged; the replacement is already authoritative
    Tolerated,
}

/// Something whose credential can be swapped
#[async_trait]
pub trait SwapTarget: Send + Sync {
    /// Replacement credential produced by [`create`](SwapTarget::create)
    type Credential: Send + Sync;
    /// What [`commit`](SwapTarget::commit) hands on to revocation
    type Committed: Send + Sync;

    /// Name used in logs and retry errors
    fn label(&self) -> String;

    fn revocation_policy(&self) -> RevocationPolicy;

    /// Mint the replacement using the current credential's authority
    async fn create(&self) -> Result<Self::Credential, UpstreamError>;

    /// Cheap read-only proof that `candidate` works
    async fn validate(&self, candidate: &Self::Credential) -> BrokerResult<()>;

    /// Persist `candidate` as authoritative and switch live references to it
    async fn commit(&self, candidate: Self::Credential) -> BrokerResult<Self::Committed>;

    /// Revoke the retired credential using the replacement's authority
    async fn revoke(&self, committed: &Self::Committed) -> BrokerResult<()>;
}

/// Result of a swap that reached `Done`
#[derive(Debug)]
pub struct SwapReport<C> {
    pub id: RotationId,
    pub committed: C,
    pub completed_at: DateTime<Utc>,
    /// Tolerated revocation failure, if any
    pub revocation_error: Option<String>,
}

/// Drives a [`SwapTarget`] through the swap state machine
#[derive(Debug, Clone, Default)]
pub struct SwapProtocol {
    retry: RetryPolicy,
}

impl SwapProtocol {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Run one swap attempt
    ///
    /// Only creation is retried here. Any other failure is returned so the
    /// scheduler can requeue the whole attempt.
    pub async fn run<T: SwapTarget>(&self, target: &T) -> BrokerResult<SwapReport<T::Committed>> {
        let id = RotationId::new();
        let label = target.label();
        let mut state = SwapState::Idle;

        tracing::info!(rotation_id = %id, target = %label, "Starting credential swap");

        state = state.transition_to(SwapState::Creating)?;
        let operation = format!("create {label}");
        let candidate = match retry_with_backoff(&self.retry, &operation, || target.create()).await {
            Ok(candidate) => candidate,
            Err(e) => return Err(fail(id, &label, state, e)),
        };

        state = state.transition_to(SwapState::Validating)?;
        tracing::debug!(rotation_id = %id, target = %label, state = %state, "Replacement created");
        if let Err(e) = target.validate(&candidate).await {
            return Err(fail(id, &label, state, e));
        }

        state = state.transition_to(SwapState::Committing)?;
        tracing::debug!(rotation_id = %id, target = %label, state = %state, "Replacement validated");
        let committed = match target.commit(candidate).await {
            Ok(committed) => committed,
            Err(e) => return Err(fail(id, &label, state, e)),
        };

        state = state.transition_to(SwapState::Revoking)?;
        tracing::debug!(rotation_id = %id, target = %label, state = %state, "Replacement committed");
        let revocation_error = match target.revoke(&committed).await {
            Ok(()) => None,
            Err(e) => match target.revocation_policy() {
                RevocationPolicy::Fatal => return Err(fail(id, &label, state, e)),
                RevocationPolicy::Tolerated => {
                    tracing::warn!(
                        rotation_id = %id,
                        target = %label,
                        error = %e,
                        "Failed to revoke retired credential; replacement stays authoritative"
                    );
                    Some(e.to_string())
                }
            },
        };

        state = state.transition_to(SwapState::Done)?;
        tracing::info!(rotation_id = %id, target = %label, state = %state, "Credential swap complete");

        Ok(SwapReport {
            id,
            committed,
            completed_at: Utc::now(),
            revocation_error,
        })
    }
}

/// Move `state` to `Failed` and hand back the error that ended the attempt
fn fail(id: RotationId, label: &str, state: SwapState, error: BrokerError) -> BrokerError {
    let failed = match state.transition_to(SwapState::Failed) {
        Ok(failed) => failed,
        Err(invalid) => return invalid,
    };
    tracing::error!(
        rotation_id = %id,
        target = %label,
        from = %state,
        state = %failed,
        error = %error,
        "Credential swap failed"
    );
    error
}
