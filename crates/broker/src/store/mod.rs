//! Durable key-value storage
//!
//! The broker keeps every authoritative record in a [`DurableStore`]; all
//! in-memory state is rebuilt from it on [`Broker::open`](crate::Broker::open).
//! Records are JSON-encoded through [`get_json`] and [`put_json`].

mod memory;

pub mod keys;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Key-value store with per-call atomicity and no multi-key transactions
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fetch the value under `key`, `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write `value` under `key`, replacing any previous value
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove `key`; removing an absent key is not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Keys under `prefix`, with the prefix stripped, in lexical order
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Read and decode a JSON record
pub async fn get_json<T>(store: &dyn DurableStore, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Encode and write a JSON record
pub async fn put_json<T>(store: &dyn DurableStore, key: &str, value: &T) -> Result<(), StoreError>
where
    T: Serialize + Sync,
{
    let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })?;
    store.put(key, bytes).await
}
