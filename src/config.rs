//! Context-wide configuration.
//!
//! Read on every operation, so changes made through
//! [`Pulsy::configure`](crate::Pulsy::configure) apply to subsequent calls.
//! The plain settings can be loaded from TOML; observer hooks are set in
//! code.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{PulsyError, Result};

/// Default prefix of persisted store keys.
pub const DEFAULT_NAMESPACE: &str = "pulsy_";

/// Observer called with a store name and its value as JSON.
pub type StoreHook = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

/// What happens to a store entry when its last binding subscriber detaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Entries live as long as the context.
    #[default]
    Keep,
    /// Entries are removed when `Subscription::unsubscribe` leaves zero
    /// subscribers.
    DropWhenUnsubscribed,
}

/// Configuration shared by every store of a context.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulsyConfig {
    /// Render diagnostic events at `info` level instead of `debug`.
    pub enable_dev_tools: bool,
    /// Persist every store, whatever its own options say.
    pub persist: bool,
    /// Default for the advisory memoization flag.
    pub memoize: bool,
    /// Prefix of persisted store keys.
    pub namespace: String,
    /// Entry retention once bindings detach.
    pub retention: RetentionPolicy,
    /// Called after a store is registered.
    #[serde(skip)]
    pub on_store_create: Option<StoreHook>,
    /// Called after every committed value.
    #[serde(skip)]
    pub on_store_update: Option<StoreHook>,
}

impl Default for PulsyConfig {
    fn default() -> Self {
        Self {
            enable_dev_tools: false,
            persist: false,
            memoize: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            retention: RetentionPolicy::Keep,
            on_store_create: None,
            on_store_update: None,
        }
    }
}

impl PulsyConfig {
    /// Parse the plain settings from a TOML document. Missing keys keep
    /// their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that serde cannot: the namespace must be non-empty so
    /// persisted keys stay distinguishable from unrelated ones.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(PulsyError::Configuration(
                "namespace cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Load the plain settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Set the creation observer.
    pub fn on_store_create<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &serde_json::Value) + Send + Sync + 'static,
    {
        self.on_store_create = Some(Arc::new(hook));
        self
    }

    /// Set the update observer.
    pub fn on_store_update<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &serde_json::Value) + Send + Sync + 'static,
    {
        self.on_store_update = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for PulsyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PulsyConfig")
            .field("enable_dev_tools", &self.enable_dev_tools)
            .field("persist", &self.persist)
            .field("memoize", &self.memoize)
            .field("namespace", &self.namespace)
            .field("retention", &self.retention)
            .field("on_store_create", &self.on_store_create.is_some())
            .field("on_store_update", &self.on_store_update.is_some())
            .finish()
    }
}
