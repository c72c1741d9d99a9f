//! Named async locks
//!
//! One `RwLock` per name (library set or static role), created on first use
//! and dropped from the map once nobody holds or waits on it. Guards are
//! owned so they can live across `.await` points.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type LockMap = DashMap<String, Arc<RwLock<()>>>;

/// Sharded map of per-name locks
#[derive(Debug, Default, Clone)]
pub struct NamedLocks {
    locks: Arc<LockMap>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access to `name`
    pub async fn read(&self, name: &str) -> NamedGuard<OwnedRwLockReadGuard<()>> {
        let guard = self.lock_for(name).read_owned().await;
        NamedGuard::new(guard, name, &self.locks)
    }

    /// Exclusive access to `name`
    pub async fn write(&self, name: &str) -> NamedGuard<OwnedRwLockWriteGuard<()>> {
        let guard = self.lock_for(name).write_owned().await;
        NamedGuard::new(guard, name, &self.locks)
    }

    /// Number of names with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn lock_for(&self, name: &str) -> Arc<RwLock<()>> {
        Arc::clone(self.locks.entry(name.to_string()).or_default().value())
    }
}

/// Held lock on one name; releases and prunes the entry on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct NamedGuard<G> {
    guard: Option<G>,
    name: String,
    locks: Arc<LockMap>,
}

impl<G> NamedGuard<G> {
    fn new(guard: G, name: &str, locks: &Arc<LockMap>) -> Self {
        Self {
            guard: Some(guard),
            name: name.to_string(),
            locks: Arc::clone(locks),
        }
    }

    /// Name this guard locks
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<G> Drop for NamedGuard<G> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: no holder and no waiter.
        self.locks
            .remove_if(&self.name, |_, lock| Arc::strong_count(lock) == 1);
    }
}
