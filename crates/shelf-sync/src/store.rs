// File: shelf-sync/src/store.rs
// Purpose: Typed access to the persisted engine documents

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::config::StorageBackend;
use crate::storage::{DetachedStorage, FilesystemStorage, MemoryStorage, Storage};

/// Cached record collection (array of books)
pub const BOOKS_CACHE_KEY: &str = "offlineBooksCache";
/// Pending action queue (array of queued actions)
pub const ACTION_QUEUE_KEY: &str = "offlineActionQueue";
/// Local ids of records that exist only on this device
pub const LOCAL_IDS_KEY: &str = "offlineBooksCacheId";

/// Typed façade over a [`Storage`] backend
///
/// A document that fails to decode is logged and read as absent; callers
/// always get a usable default.
#[derive(Clone)]
pub struct PersistentStore {
    backend: Arc<dyn Storage>,
}

impl PersistentStore {
    pub fn new(backend: Arc<dyn Storage>) -> Self {
        Self { backend }
    }

    /// Create a store from config
    pub async fn from_backend(backend: &StorageBackend) -> Result<Self> {
        let storage: Arc<dyn Storage> = match backend {
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
            StorageBackend::Filesystem(config) => {
                Arc::new(FilesystemStorage::new(config.clone()).await?)
            }
            StorageBackend::Detached => Arc::new(DetachedStorage),
        };
        Ok(Self::new(storage))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Seed empty documents for the cache and the queue if they are absent
    pub async fn initialize(&self) -> Result<()> {
        for key in [BOOKS_CACHE_KEY, ACTION_QUEUE_KEY] {
            if self.backend.get(key).await?.is_none() {
                self.backend.set(key, Value::Array(Vec::new())).await?;
            }
        }
        Ok(())
    }

    /// Read and decode a document
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(value) = self.backend.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_value(value) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(e) => {
                tracing::error!("Discarding unreadable document {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Read a list document, absent or unreadable reads as empty
    pub async fn get_list<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        Ok(self.get(key).await?.unwrap_or_default())
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to encode document {}", key))?;
        self.backend.set(key, value).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.backend.remove(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_initialize_seeds_empty_documents() {
        let storage = MemoryStorage::new();
        let store = PersistentStore::new(Arc::new(storage.clone()));

        store.initialize().await.unwrap();

        assert_eq!(storage.get(BOOKS_CACHE_KEY).await.unwrap(), Some(json!([])));
        assert_eq!(storage.get(ACTION_QUEUE_KEY).await.unwrap(), Some(json!([])));
    }

    #[tokio::test]
    async fn test_initialize_keeps_existing_documents() {
        let storage = MemoryStorage::new();
        storage.set(BOOKS_CACHE_KEY, json!([{"id": "srv-1"}])).await.unwrap();

        let store = PersistentStore::new(Arc::new(storage.clone()));
        store.initialize().await.unwrap();

        assert_eq!(storage.get(BOOKS_CACHE_KEY).await.unwrap(), Some(json!([{"id": "srv-1"}])));
    }

    #[tokio::test]
    async fn test_unreadable_document_reads_as_absent() {
        let storage = MemoryStorage::new();
        storage.set(LOCAL_IDS_KEY, json!({"not": "a list"})).await.unwrap();

        let store = PersistentStore::new(Arc::new(storage));
        let ids: Vec<String> = store.get_list(LOCAL_IDS_KEY).await.unwrap();
        assert!(ids.is_empty());
    }
}
