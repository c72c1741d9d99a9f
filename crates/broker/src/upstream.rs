//! Upstream API surface consumed by the broker
//!
//! The broker never talks HTTP itself. It is handed an [`UpstreamConnector`]
//! that turns a credential into an [`UpstreamClient`] acting with that
//! credential's authority.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;
use crate::secret::SecretString;

/// Externally managed principal (service account)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Opaque upstream id
    pub id: String,
    /// Display name
    pub name: String,
    /// Project or namespace the identity lives in
    pub scope: String,
}

/// API key minted for an identity
#[derive(Debug, Clone)]
pub struct ApiKey {
    /// Upstream key id, used to delete the key later
    pub id: String,
    /// Identity the key authenticates as
    pub identity_id: String,
    /// Key material handed to the borrower
    pub secret: SecretString,
    /// Upstream-enforced expiry, if the key was minted with a ttl
    pub expires_at: Option<DateTime<Utc>>,
}

/// Freshly minted admin credential
#[derive(Debug, Clone)]
pub struct IssuedAdminCredential {
    /// Upstream id used for revocation
    pub external_id: String,
    /// Credential material
    pub value: SecretString,
}

/// Client acting with the authority of one credential
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Create an identity together with its first key
    async fn create_identity(
        &self,
        scope: &str,
        name: &str,
    ) -> Result<(Identity, ApiKey), UpstreamError>;

    /// Delete an identity and every key it holds
    async fn delete_identity(&self, identity_id: &str, scope: &str) -> Result<(), UpstreamError>;

    /// Mint a key for an identity; `None` means no upstream expiry
    async fn create_key(
        &self,
        identity_id: &str,
        ttl: Option<Duration>,
    ) -> Result<ApiKey, UpstreamError>;

    /// Delete a key by id
    async fn delete_key(&self, key_id: &str) -> Result<(), UpstreamError>;

    /// Look up an identity, `UpstreamError::NotFound` if it is not in `scope`
    async fn get_identity(&self, identity_id: &str, scope: &str)
    -> Result<Identity, UpstreamError>;

    /// All identities in `scope`
    async fn list_identities(&self, scope: &str) -> Result<Vec<Identity>, UpstreamError>;

    /// Mint a new admin credential named `name`
    async fn create_admin_credential(
        &self,
        name: &str,
    ) -> Result<IssuedAdminCredential, UpstreamError>;

    /// Revoke an admin credential by upstream id
    async fn revoke_admin_credential(&self, external_id: &str) -> Result<(), UpstreamError>;

    /// Cheap read-only call proving the client's credential works
    async fn validate_connectivity(&self) -> Result<(), UpstreamError>;
}

/// Builds clients bound to a credential
pub trait UpstreamConnector: Send + Sync {
    /// Client acting as `credential`
    fn connect(&self, credential: &SecretString) -> Result<Arc<dyn UpstreamClient>, UpstreamError>;
}

/// Live admin client together with the id of the credential behind it
pub struct ActiveClient {
    client: Arc<dyn UpstreamClient>,
    external_id: String,
}

impl ActiveClient {
    pub fn new(client: Arc<dyn UpstreamClient>, external_id: impl Into<String>) -> Self {
        Self {
            client,
            external_id: external_id.into(),
        }
    }

    /// The client itself
    pub fn client(&self) -> Arc<dyn UpstreamClient> {
        Arc::clone(&self.client)
    }

    /// Upstream id of the admin credential the client acts as
    pub fn external_id(&self) -> &str {
        &self.external_id
    }
}

impl std::fmt::Debug for ActiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveClient")
            .field("external_id", &self.external_id)
            .finish()
    }
}
