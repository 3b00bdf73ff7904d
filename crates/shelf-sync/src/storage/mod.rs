//! Storage backends for persisted engine documents

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub mod detached;
pub mod filesystem;
pub mod memory;

pub use detached::DetachedStorage;
pub use filesystem::FilesystemStorage;
pub use memory::MemoryStorage;

/// Trait for key/value storage of JSON documents
///
/// Every operation is idempotent and works without prior initialization:
/// a missing key reads as `None`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Get a document by key
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store a document, replacing any previous value
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a document
    async fn remove(&self, key: &str) -> Result<()>;

    /// Get all stored keys
    async fn keys(&self) -> Result<Vec<String>>;

    /// Get storage backend name
    fn name(&self) -> &'static str;
}
