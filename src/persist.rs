//! Persistence adapter: versioned envelopes in a storage backend.
//!
//! A store value is written as `{"value": <T>, "version": <n>}` under
//! `<namespace><store name>`. Reading an envelope whose version differs from
//! the requested one runs the caller's migration, if any, and immediately
//! writes the migrated value back at the requested version.
//!
//! Failures never reach the caller. They are logged, reported as
//! [`StoreEvent`]s and the in-memory value stays authoritative.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{PulsyError, Result};
use crate::storage::StorageBackend;
use crate::watch::{EventSender, StoreEvent};

/// Envelope version used when a store does not ask for one.
pub const DEFAULT_VERSION: u32 = 1;

/// Turns a stored value of an older version into the current shape.
///
/// Receives the raw stored value and the stored version.
pub type Migrate<T> = Arc<dyn Fn(serde_json::Value, u32) -> Result<T> + Send + Sync>;

/// The serialized form of a persisted store value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub value: serde_json::Value,
    pub version: u32,
}

/// Encodes envelopes to and from the backend's string values.
pub trait EnvelopeCodec: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> Result<String>;
    fn decode(&self, raw: &str) -> Result<Envelope>;
}

/// Plain JSON encoding, the default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<String> {
        Ok(serde_json::to_string(envelope)?)
    }

    fn decode(&self, raw: &str) -> Result<Envelope> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Per-store persistence settings.
pub struct PersistOptions<T> {
    /// Version written into envelopes and expected when reading them.
    pub version: u32,
    /// Called when the stored version differs from `version`.
    pub migrate: Option<Migrate<T>>,
    /// Backend override; the context's default backend otherwise.
    pub storage: Option<Arc<dyn StorageBackend>>,
    /// Codec override; [`JsonCodec`] otherwise.
    pub codec: Option<Arc<dyn EnvelopeCodec>>,
}

impl<T> PersistOptions<T> {
    pub fn new() -> Self {
        Self {
            version: DEFAULT_VERSION,
            migrate: None,
            storage: None,
            codec: None,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn migrate<F>(mut self, migrate: F) -> Self
    where
        F: Fn(serde_json::Value, u32) -> Result<T> + Send + Sync + 'static,
    {
        self.migrate = Some(Arc::new(migrate));
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.codec = Some(codec);
        self
    }
}

impl<T> Default for PersistOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PersistOptions<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            migrate: self.migrate.clone(),
            storage: self.storage.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<T> fmt::Debug for PersistOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistOptions")
            .field("version", &self.version)
            .field("migrate", &self.migrate.is_some())
            .field("storage", &self.storage.is_some())
            .field("codec", &self.codec.is_some())
            .finish()
    }
}

/// How a store asks to be persisted.
pub enum Persist<T> {
    Disabled,
    Enabled,
    Options(PersistOptions<T>),
}

impl<T> Persist<T> {
    /// Resolve against the context-wide default: a store is persisted if it
    /// asks for it or the context persists everything.
    pub fn resolve(descriptor: Option<Persist<T>>, global: bool) -> Option<PersistOptions<T>> {
        match descriptor {
            Some(Persist::Options(options)) => Some(options),
            Some(Persist::Enabled) => Some(PersistOptions::new()),
            Some(Persist::Disabled) | None if global => Some(PersistOptions::new()),
            Some(Persist::Disabled) | None => None,
        }
    }
}

impl<T> From<bool> for Persist<T> {
    fn from(enabled: bool) -> Self {
        if enabled {
            Persist::Enabled
        } else {
            Persist::Disabled
        }
    }
}

impl<T> From<PersistOptions<T>> for Persist<T> {
    fn from(options: PersistOptions<T>) -> Self {
        Persist::Options(options)
    }
}

/// Reads and writes store envelopes.
#[derive(Clone)]
pub struct Persistence {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
    events: EventSender,
}

impl Persistence {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        namespace: impl Into<String>,
        events: EventSender,
    ) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            events,
        }
    }

    /// The default backend.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Backend key for a store name.
    pub fn storage_key(&self, name: &str) -> String {
        format!("{}{}", self.namespace, name)
    }

    fn backend_for<'a, T>(&'a self, options: &'a PersistOptions<T>) -> &'a dyn StorageBackend {
        options.storage.as_deref().unwrap_or(self.backend.as_ref())
    }

    fn codec_for<T>(options: &PersistOptions<T>) -> &dyn EnvelopeCodec {
        options.codec.as_deref().unwrap_or(&JsonCodec)
    }

    /// Write `value` at `options.version`. Returns whether the write landed.
    pub async fn persist<T: Serialize>(
        &self,
        name: &str,
        value: &T,
        options: &PersistOptions<T>,
    ) -> bool {
        match self.try_persist(name, value, options).await {
            Ok(()) => {
                debug!(store = %name, version = options.version, "persisted store value");
                self.events.send(StoreEvent::persisted(name, options.version));
                true
            }
            Err(e) => {
                warn!(store = %name, error = %e, "failed to persist store value");
                self.events.send(StoreEvent::persist_failed(name, e.to_string()));
                false
            }
        }
    }

    async fn try_persist<T: Serialize>(
        &self,
        name: &str,
        value: &T,
        options: &PersistOptions<T>,
    ) -> Result<()> {
        let envelope = Envelope {
            value: serde_json::to_value(value)?,
            version: options.version,
        };
        let raw = Self::codec_for(options).encode(&envelope)?;
        self.backend_for(options)
            .set_item(&self.storage_key(name), raw)
            .await
    }

    /// Read the stored value for `name`.
    ///
    /// `None` means nothing usable is stored: the key is absent or the
    /// envelope could not be decoded. A stored JSON `null` or `false` is a
    /// value like any other.
    pub async fn retrieve<T>(&self, name: &str, options: &PersistOptions<T>) -> Option<T>
    where
        T: Serialize + DeserializeOwned,
    {
        match self.try_retrieve(name, options).await {
            Ok(value) => value,
            Err(e) => {
                warn!(store = %name, error = %e, "failed to rehydrate store value");
                self.events.send(StoreEvent::persist_failed(name, e.to_string()));
                None
            }
        }
    }

    async fn try_retrieve<T>(&self, name: &str, options: &PersistOptions<T>) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let raw = match self.backend_for(options).get_item(&self.storage_key(name)).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let envelope = Self::codec_for(options).decode(&raw)?;

        if envelope.version != options.version {
            if let Some(migrate) = &options.migrate {
                debug!(
                    store = %name,
                    from = envelope.version,
                    to = options.version,
                    "migrating persisted store value"
                );
                let migrated = migrate(envelope.value, envelope.version)?;
                self.persist(name, &migrated, options).await;
                return Ok(Some(migrated));
            }
        }

        Ok(Some(serde_json::from_value(envelope.value)?))
    }

    /// Remove every namespaced key from `backend`, leaving unrelated keys
    /// alone. Returns the number of keys removed.
    ///
    /// Refuses to run with an empty namespace, which would match every key.
    pub async fn clear_all(&self, backend: &dyn StorageBackend) -> Result<usize> {
        if self.namespace.is_empty() {
            return Err(PulsyError::Configuration(
                "refusing to clear stores under an empty namespace".to_string(),
            ));
        }
        let keys = backend.keys_with_prefix(&self.namespace).await?;
        for key in &keys {
            backend.remove_item(key).await?;
        }
        debug!(count = keys.len(), "cleared persisted stores");
        Ok(keys.len())
    }
}

impl fmt::Debug for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistence")
            .field("namespace", &self.namespace)
            .finish()
    }
}
