use crate::cache::{Cache, CacheError, CacheKey};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A cache that lives only as long as the process.
///
/// Nothing survives a restart, so every restart re-issues certificates and registers a new
/// account. Only suitable for tests and short-lived deployments.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Vec<u8>, CacheError> {
        let name = key.validated_name()?;
        self.entries
            .read()
            .get(&name)
            .cloned()
            .ok_or(CacheError::NotFound)
    }

    async fn put(&self, key: &CacheKey, data: &[u8]) -> Result<(), CacheError> {
        let name = key.validated_name()?;
        self.entries.write().insert(name, data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let name = key.validated_name()?;
        self.entries.write().remove(&name);
        Ok(())
    }
}
