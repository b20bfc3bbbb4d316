//! In-memory storage backend.
//!
//! This backend is NOT durable - data is lost on process exit. It is the
//! default backend of a [`Pulsy`](crate::Pulsy) context and the one tests use.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{PulsyError, Result};
use crate::storage::{validate_key, StorageBackend};

/// In-memory implementation of StorageBackend.
///
/// Uses a BTreeMap for ordered key iteration and RwLock for concurrency.
/// Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<String, String>>>,
    quota: Option<usize>,
}

impl MemoryStorage {
    /// Create a new empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that rejects writes once the total size of keys and
    /// values would exceed `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            quota: Some(bytes),
        }
    }

    /// Get the number of entries in the backend.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the backend is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.data.write().clear();
    }

    fn used_bytes(data: &BTreeMap<String, String>) -> usize {
        data.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> Result<()> {
        validate_key(key)?;

        let mut data = self.data.write();
        if let Some(quota) = self.quota {
            let replaced = data.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            let needed = Self::used_bytes(&data) - replaced + key.len() + value.len();
            if needed > quota {
                return Err(PulsyError::StorageFull(format!(
                    "writing {} would use {} of {} bytes",
                    key, needed, quota
                )));
            }
        }
        data.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.data.write().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.data.read().keys().cloned().collect())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.read();
        Ok(data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
