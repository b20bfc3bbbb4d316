//! StorageBackend trait - the key-value surface persistence writes through.
//!
//! A backend holds opaque string values under string keys, the shape of a
//! browser-style durable store. [`MemoryStorage`](crate::MemoryStorage) is
//! the default; [`SqliteStorage`](crate::SqliteStorage) is durable across
//! process restarts. Any type implementing this trait may be substituted.

use async_trait::async_trait;

use crate::error::{PulsyError, Result};

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Validate that a storage key is well-formed.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(PulsyError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(PulsyError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

/// A pluggable key-value storage backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the value stored under `key`.
    ///
    /// Returns `None` if the key does not exist.
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set_item(&self, key: &str, value: String) -> Result<()>;

    /// Remove `key`.
    ///
    /// Returns `Ok(())` if the key was removed or didn't exist.
    async fn remove_item(&self, key: &str) -> Result<()>;

    /// Enumerate every key in the backend.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Check if a key exists.
    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get_item(key).await?.is_some())
    }

    /// Enumerate keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}
