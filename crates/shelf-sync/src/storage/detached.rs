//! Storage used when no platform storage is available

use crate::storage::Storage;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Reads are always empty and writes are dropped
///
/// Lets the engine run in a context without local storage (a server-side
/// render, a throwaway CLI session) without special casing every caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedStorage;

#[async_trait]
impl Storage for DetachedStorage {
    async fn get(&self, _key: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn set(&self, key: &str, _value: Value) -> Result<()> {
        tracing::trace!("Detached storage ignoring write to {}", key);
        Ok(())
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "detached"
    }
}
