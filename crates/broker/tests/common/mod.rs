//! Shared harness for broker integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use custodian_broker::prelude::*;
use custodian_broker::rotation::RetryPolicy;
use custodian_broker::testing::MockUpstream;

pub const SCOPE: &str = "proj";

/// Broker over a memory store and a mock upstream holding `sa-a`, `sa-b`, `sa-c`
pub struct Harness {
    pub upstream: MockUpstream,
    pub store: Arc<MemoryStore>,
    pub broker: Broker,
}

impl Harness {
    /// Broker with an admin credential `root` configured
    pub async fn start() -> Self {
        Self::start_with(fast_config()).await
    }

    pub async fn start_with(config: BrokerConfig) -> Self {
        let harness = Self::bare(config, MemoryStore::new()).await;
        let root = harness.upstream.seed_admin_credential("root");
        harness
            .broker
            .admin()
            .configure(AdminCredentialConfig::new(root, "root"))
            .await
            .unwrap();
        harness
    }

    /// Broker over `store` with nothing configured
    pub async fn bare(config: BrokerConfig, store: Arc<MemoryStore>) -> Self {
        custodian_log::init_test();
        let upstream = MockUpstream::new();
        for id in ["sa-a", "sa-b", "sa-c"] {
            upstream.add_identity(id, SCOPE);
        }
        let broker = Broker::open(config, store.clone(), upstream.connector())
            .await
            .unwrap();
        Self {
            upstream,
            store,
            broker,
        }
    }

    /// Shut down and open a fresh broker over the same store and upstream
    pub async fn restart(self) -> Self {
        let config = self.broker.config().clone();
        self.broker.shutdown().await;
        let broker = Broker::open(config, self.store.clone(), self.upstream.connector())
            .await
            .unwrap();
        Self {
            upstream: self.upstream,
            store: self.store,
            broker,
        }
    }

    /// Create `name` with the given members and default lease policy
    pub async fn create_set(&self, name: &str, members: &[&str]) -> LibrarySet {
        self.broker
            .library_sets()
            .create(LibrarySet::new(name, members.iter().copied(), SCOPE))
            .await
            .unwrap()
    }
}

/// Fast polling and millisecond creation backoff
pub fn fast_config() -> BrokerConfig {
    BrokerConfig {
        poll_interval: Duration::from_millis(20),
        swap_retry: RetryPolicy::new(3, Duration::from_millis(1)),
        ..BrokerConfig::default()
    }
}

pub fn alice() -> Borrower {
    Borrower::new("entity-alice", "token-alice")
}

pub fn bob() -> Borrower {
    Borrower::new("entity-bob", "token-bob")
}

/// Poll `check` every 10ms for up to 2s
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
