//! Broker handle and shared context
//!
//! [`Broker::open`] is the only constructor: it loads persisted state,
//! rebuilds the derived in-memory state, rotates an overdue admin credential
//! before returning and starts the rotation scheduler.
//! [`Broker::shutdown`] (or dropping the broker) stops the scheduler.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admin::AdminCredentialManager;
use crate::checkout::CheckoutStore;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult, ResourceKind};
use crate::library::{LibrarySetManager, ManagedIdentities};
use crate::locks::NamedLocks;
use crate::rotation::scheduler::{self, due_after};
use crate::rotation::{RotationKey, RotationScheduler, Rotator, SchedulerHandle, SwapProtocol};
use crate::static_role::StaticRoleManager;
use crate::store::DurableStore;
use crate::upstream::{ActiveClient, UpstreamClient, UpstreamConnector};

/// State shared by every operation and the scheduler's rotation tasks
pub(crate) struct BrokerContext {
    pub(crate) config: BrokerConfig,
    pub(crate) store: Arc<dyn DurableStore>,
    pub(crate) connector: Arc<dyn UpstreamConnector>,
    pub(crate) checkouts: CheckoutStore,
    pub(crate) managed: ManagedIdentities,
    pub(crate) set_locks: NamedLocks,
    pub(crate) role_locks: NamedLocks,
    pub(crate) admin_lock: Mutex<()>,
    pub(crate) scheduler: SchedulerHandle,
    pub(crate) swap: SwapProtocol,
    active: ArcSwapOption<ActiveClient>,
}

impl BrokerContext {
    fn new(
        config: BrokerConfig,
        store: Arc<dyn DurableStore>,
        connector: Arc<dyn UpstreamConnector>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            swap: SwapProtocol::new(config.swap_retry.clone()),
            checkouts: CheckoutStore::new(Arc::clone(&store)),
            config,
            store,
            connector,
            managed: ManagedIdentities::new(),
            set_locks: NamedLocks::new(),
            role_locks: NamedLocks::new(),
            admin_lock: Mutex::new(()),
            scheduler,
            active: ArcSwapOption::empty(),
        }
    }

    /// Client acting as the current admin credential
    pub(crate) fn admin_client(&self) -> BrokerResult<Arc<dyn UpstreamClient>> {
        self.active
            .load_full()
            .map(|active| active.client())
            .ok_or_else(|| BrokerError::not_found(ResourceKind::AdminCredential, "admin"))
    }

    /// Point every subsequent operation at `client`
    pub(crate) fn install_client(&self, client: Arc<dyn UpstreamClient>, external_id: &str) {
        self.active
            .store(Some(Arc::new(ActiveClient::new(client, external_id))));
    }

    pub(crate) fn active_external_id(&self) -> Option<String> {
        self.active
            .load()
            .as_ref()
            .map(|active| active.external_id().to_string())
    }
}

struct BrokerRotator {
    ctx: Arc<BrokerContext>,
}

#[async_trait]
impl Rotator for BrokerRotator {
    async fn rotate(&self, key: &RotationKey) -> BrokerResult<Option<Duration>> {
        match key {
            RotationKey::Admin => {
                AdminCredentialManager::new(&self.ctx)
                    .rotate_scheduled()
                    .await
            }
            RotationKey::StaticRole(name) => {
                StaticRoleManager::new(&self.ctx)
                    .rotate_scheduled(name)
                    .await
            }
        }
    }
}

/// Running credential broker
pub struct Broker {
    ctx: Arc<BrokerContext>,
    shutdown: CancellationToken,
    scheduler_task: Option<JoinHandle<()>>,
}

impl Broker {
    /// Open the broker over `store`, reaching upstream through `connector`
    ///
    /// An overdue admin credential is rotated before this returns. If that
    /// rotation fails the broker still opens and the scheduler retries it.
    pub async fn open(
        config: BrokerConfig,
        store: Arc<dyn DurableStore>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> BrokerResult<Self> {
        config.validate()?;
        let (handle, commands) = scheduler::channel(config.command_buffer);
        let ctx = Arc::new(BrokerContext::new(config, store, connector, handle.clone()));

        let admin = AdminCredentialManager::new(&ctx);
        admin.activate_stored().await?;
        ctx.managed.rebuild(ctx.store.as_ref()).await?;

        match admin.rotate_if_overdue(Utc::now()).await {
            Ok(true) => tracing::info!("Overdue admin credential rotated at startup"),
            Ok(false) => {}
            Err(e) => tracing::error!(
                error = %e,
                "Overdue admin credential rotation failed at startup; the scheduler will retry"
            ),
        }

        let shutdown = CancellationToken::new();
        let rotator = Arc::new(BrokerRotator {
            ctx: Arc::clone(&ctx),
        });
        let scheduler_task =
            RotationScheduler::new(&ctx.config, handle, commands, rotator, shutdown.clone()).spawn();

        let broker = Self {
            ctx,
            shutdown,
            scheduler_task: Some(scheduler_task),
        };
        broker.seed_schedule().await?;

        tracing::info!(
            managed_identities = broker.ctx.managed.len(),
            admin_configured = broker.ctx.active_external_id().is_some(),
            "Broker opened"
        );
        Ok(broker)
    }

    /// Library set operations
    pub fn library_sets(&self) -> LibrarySetManager<'_> {
        LibrarySetManager::new(&self.ctx)
    }

    /// Admin credential operations
    pub fn admin(&self) -> AdminCredentialManager<'_> {
        AdminCredentialManager::new(&self.ctx)
    }

    /// Static role operations
    pub fn static_roles(&self) -> StaticRoleManager<'_> {
        StaticRoleManager::new(&self.ctx)
    }

    /// Scheduler commands and inspection
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.ctx.scheduler
    }

    /// Which sets manage each identity
    pub fn managed_identities(&self) -> &ManagedIdentities {
        &self.ctx.managed
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.ctx.config
    }

    /// Stop the scheduler loop
    ///
    /// Rotations already dispatched are left to finish on their own.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.scheduler_task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Rotation scheduler task ended abnormally");
            }
        }
        tracing::info!("Broker shut down");
    }

    /// Queue every credential with a rotation period, overdue ones for now
    async fn seed_schedule(&self) -> BrokerResult<()> {
        let now = Utc::now();
        let scheduler = &self.ctx.scheduler;

        if let Some(admin) = self.admin().load().await? {
            if let Some(due_at) = admin.next_rotation_at() {
                scheduler.schedule(RotationKey::Admin, due_at.max(now)).await;
            }
        }

        let roles = self.static_roles();
        let mut seeded = 0usize;
        for name in roles.list().await? {
            let Some(role) = roles.load(&name).await? else {
                continue;
            };
            if role.rotation_period.is_zero() {
                continue;
            }
            let due_at = due_after(role.last_rotated_at, role.rotation_period).max(now);
            scheduler.schedule(RotationKey::StaticRole(name), due_at).await;
            seeded += 1;
        }

        tracing::debug!(static_roles = seeded, "Rotation schedule seeded");
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.ctx.config)
            .field("admin_external_id", &self.ctx.active_external_id())
            .field("managed_identities", &self.ctx.managed.len())
            .finish_non_exhaustive()
    }
}
