//! The store registry and update pipeline.
//!
//! [`Pulsy`] is the context object owning every store of an application.
//! Clone it freely; all clones share the same registry, configuration,
//! default storage backend and event channel.
//!
//! Writes go through [`Pulsy::dispatch_set`]:
//!
//! 1. resolve the candidate (literal or function of the current value)
//! 2. fold it through the middleware chain, awaiting each stage in order
//! 3. commit it as the current value
//! 4. notify every subscriber once
//! 5. call the `on_store_update` observer
//! 6. persist, if the store is persisted
//!
//! A failure in any stage is logged and ends the write; the caller's future
//! resolves either way. Writes to unknown stores are ignored, while reads of
//! unknown stores fail with [`PulsyError::NotFound`].
//!
//! There is no per-store lock across stages. Two writes to one store issued
//! without awaiting the first can interleave at middleware suspension
//! points, and the last commit wins. Callers that need ordering must await
//! each write before issuing the next.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::config::{PulsyConfig, RetentionPolicy};
use crate::error::{PulsyError, Result};
use crate::memory::MemoryStorage;
use crate::middleware::{run_chain, BoxMiddleware, Middleware};
use crate::persist::{Persist, Persistence};
use crate::record::{AnyStore, StoreRecord, StoreValue, SubscriptionId};
use crate::storage::StorageBackend;
use crate::watch::{EventSender, EventStream, StoreEvent};

/// Options for [`Pulsy::create_store`].
pub struct StoreOptions<T> {
    /// Persistence descriptor; absent means "use the context default".
    pub persist: Option<Persist<T>>,
    /// Advisory memoization flag for bindings; context default when absent.
    pub memoize: Option<bool>,
    /// Initial middleware chain.
    pub middleware: Vec<BoxMiddleware<T>>,
}

impl<T> StoreOptions<T> {
    pub fn new() -> Self {
        Self {
            persist: None,
            memoize: None,
            middleware: Vec::new(),
        }
    }

    pub fn persist(mut self, persist: impl Into<Persist<T>>) -> Self {
        self.persist = Some(persist.into());
        self
    }

    pub fn memoize(mut self, memoize: bool) -> Self {
        self.memoize = Some(memoize);
        self
    }

    pub fn middleware(mut self, stage: impl Middleware<T> + 'static) -> Self {
        self.middleware.push(Arc::new(stage));
        self
    }
}

impl<T> Default for StoreOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The argument of a write: a value, or a function of the current value.
pub enum Update<T> {
    Value(T),
    With(Box<dyn FnOnce(&T) -> T + Send>),
}

impl<T> Update<T> {
    pub fn with<F>(f: F) -> Self
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        Update::With(Box::new(f))
    }

    pub(crate) fn resolve(self, current: &T) -> T {
        match self {
            Update::Value(value) => value,
            Update::With(f) => f(current),
        }
    }
}

/// Reject names that cannot identify a store.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(PulsyError::Configuration(
            "store name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

struct Inner {
    stores: RwLock<HashMap<String, Arc<dyn AnyStore>>>,
    config: RwLock<PulsyConfig>,
    backend: Arc<dyn StorageBackend>,
    events: EventSender,
}

/// Handle to a store registry.
#[derive(Clone)]
pub struct Pulsy {
    inner: Arc<Inner>,
}

/// Non-owning handle, held by callbacks the registry itself stores.
#[derive(Clone)]
pub struct WeakPulsy {
    inner: Weak<Inner>,
}

impl WeakPulsy {
    pub fn upgrade(&self) -> Option<Pulsy> {
        self.inner.upgrade().map(|inner| Pulsy { inner })
    }
}

/// A subscriber attached through [`Pulsy::subscribe`].
///
/// The callback stays attached while this handle lives. Dropping it, or
/// calling [`Subscription::unsubscribe`], detaches the callback and applies
/// the context's retention policy.
#[must_use = "dropping a Subscription detaches its callback"]
pub struct Subscription {
    store: String,
    id: SubscriptionId,
    record: Weak<dyn AnyStore>,
    pulsy: WeakPulsy,
}

impl Subscription {
    pub fn store(&self) -> &str {
        &self.store
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Detach the subscriber, applying the context's retention policy.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(pulsy) = self.pulsy.upgrade() {
            pulsy.detach(&self.store, &self.record, self.id);
        }
    }
}

impl Pulsy {
    /// Create a context with default configuration and in-memory storage.
    pub fn new() -> Self {
        Self::with_config(PulsyConfig::default())
    }

    /// Create a context with in-memory storage.
    pub fn with_config(config: PulsyConfig) -> Self {
        Self::from_parts(config, Arc::new(MemoryStorage::new()))
    }

    /// Create a context over an existing storage backend.
    pub fn from_parts(config: PulsyConfig, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner: Arc::new(Inner {
                stores: RwLock::new(HashMap::new()),
                config: RwLock::new(config),
                backend,
                events: EventSender::default(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakPulsy {
        WeakPulsy {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> PulsyConfig {
        self.inner.config.read().clone()
    }

    /// Change the configuration; later operations observe the change.
    pub fn configure<F>(&self, f: F)
    where
        F: FnOnce(&mut PulsyConfig),
    {
        f(&mut self.inner.config.write());
    }

    /// Stream of diagnostic events for stores matching `pattern`.
    pub fn events(&self, pattern: impl Into<String>) -> EventStream {
        self.inner.events.subscribe(pattern)
    }

    /// Persistence adapter over the default backend and current namespace.
    pub fn persistence(&self) -> Persistence {
        let namespace = self.inner.config.read().namespace.clone();
        Persistence::new(
            Arc::clone(&self.inner.backend),
            namespace,
            self.inner.events.clone(),
        )
    }

    /// Register a store.
    ///
    /// Creating a name that already exists is a no-op: the existing value
    /// is kept and a warning is logged. When the store is persisted, a
    /// previously stored value replaces `initial`.
    pub async fn create_store<T: StoreValue>(
        &self,
        name: &str,
        initial: T,
        options: StoreOptions<T>,
    ) -> Result<()> {
        self.install(name, initial, options, true).await.map(|_| ())
    }

    /// Register a store, returning false if the name was taken. Derived
    /// stores pass `persistable = false` so the context default cannot turn
    /// persistence on for them.
    pub(crate) async fn install<T: StoreValue>(
        &self,
        name: &str,
        initial: T,
        options: StoreOptions<T>,
        persistable: bool,
    ) -> Result<bool> {
        validate_name(name)?;
        if self.has_store(name) {
            warn!(store = %name, "store already exists, keeping current value");
            return Ok(false);
        }

        let (global_persist, global_memoize) = {
            let config = self.inner.config.read();
            (config.persist, config.memoize)
        };
        let persist = if persistable {
            Persist::resolve(options.persist, global_persist)
        } else {
            None
        };
        let memoize = options.memoize.unwrap_or(global_memoize);

        let value = match &persist {
            Some(persist_options) => self
                .persistence()
                .retrieve(name, persist_options)
                .await
                .unwrap_or(initial),
            None => initial,
        };

        let record = Arc::new(StoreRecord::new(
            name,
            value.clone(),
            options.middleware,
            memoize,
            persist,
        ));
        {
            let mut stores = self.inner.stores.write();
            if stores.contains_key(name) {
                warn!(store = %name, "store already exists, keeping current value");
                return Ok(false);
            }
            stores.insert(name.to_string(), record.clone());
        }

        let payload = serde_json::to_value(&value).ok();
        let hook = self.inner.config.read().on_store_create.clone();
        if let Some(hook) = hook {
            hook(name, payload.as_ref().unwrap_or(&serde_json::Value::Null));
        }
        self.emit(StoreEvent::created(name, payload));

        self.persist_record(&record).await;
        Ok(true)
    }

    /// Create stores of one type in a batch.
    ///
    /// The first invalid entry aborts the batch: entries before it are
    /// created, entries after it are not.
    pub async fn initialize_stores<T, K, I>(&self, entries: I) -> Result<()>
    where
        T: StoreValue,
        K: AsRef<str> + Send,
        I: IntoIterator<Item = (K, T)>,
    {
        let entries: Vec<(K, T)> = entries.into_iter().collect();
        for (name, value) in entries {
            if let Err(e) = self
                .create_store(name.as_ref(), value, StoreOptions::new())
                .await
            {
                error!(store = %name.as_ref(), error = %e, "store initialization aborted");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Current value of a store.
    pub fn get_store_value<T: StoreValue>(&self, name: &str) -> Result<T> {
        Ok(self.record::<T>(name)?.get())
    }

    /// Append a middleware stage to a store's chain. Applies to writes that
    /// start after this call.
    pub fn add_middleware<T, M>(&self, name: &str, stage: M) -> Result<()>
    where
        T: StoreValue,
        M: Middleware<T> + 'static,
    {
        self.record::<T>(name)?.add_middleware(Arc::new(stage));
        Ok(())
    }

    /// Attach a callback invoked with every committed value.
    pub fn subscribe<T, F>(&self, name: &str, callback: F) -> Result<Subscription>
    where
        T: StoreValue,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let record = self.record::<T>(name)?;
        let id = record.subscribe(Arc::new(callback));
        let record: Arc<dyn AnyStore> = record;
        Ok(Subscription {
            store: name.to_string(),
            id,
            record: Arc::downgrade(&record),
            pulsy: self.downgrade(),
        })
    }

    fn detach(&self, name: &str, record: &Weak<dyn AnyStore>, id: SubscriptionId) {
        let Some(store) = record.upgrade() else {
            return;
        };
        let remaining = store.unsubscribe(id);
        let retention = self.inner.config.read().retention;
        if remaining == 0 && retention == RetentionPolicy::DropWhenUnsubscribed {
            let removed = {
                let mut stores = self.inner.stores.write();
                let current = stores
                    .get(name)
                    .is_some_and(|entry| Arc::ptr_eq(entry, &store));
                if current {
                    stores.remove(name)
                } else {
                    None
                }
            };
            if let Some(removed) = removed {
                let released = removed.release_dependencies();
                debug!(store = %name, released, "dropped store after last subscriber detached");
            }
        }
    }

    /// Write a value through the update pipeline.
    pub async fn set_store_value<T: StoreValue>(&self, name: &str, value: T) {
        self.dispatch_set(name, Update::Value(value)).await
    }

    /// Write a function of the current value through the update pipeline.
    pub async fn update_store_value<T, F>(&self, name: &str, f: F)
    where
        T: StoreValue,
        F: FnOnce(&T) -> T + Send + 'static,
    {
        self.dispatch_set(name, Update::with(f)).await
    }

    /// Run the update pipeline. Never fails: unknown stores are ignored and
    /// stage failures are logged.
    pub async fn dispatch_set<T: StoreValue>(&self, name: &str, update: Update<T>) {
        let record = match self.record::<T>(name) {
            Ok(record) => record,
            Err(PulsyError::NotFound(_)) => {
                debug!(store = %name, "ignoring write to unknown store");
                return;
            }
            Err(e) => {
                self.report_error(name, e.to_string());
                return;
            }
        };

        let prev = record.get();
        let candidate = update.resolve(&prev);
        let chain = record.middleware_snapshot();

        let next = match run_chain(&chain, candidate, &prev, name).await {
            Ok(next) => next,
            Err(e) => {
                self.report_error(name, e.to_string());
                return;
            }
        };

        self.commit(&record, next);
        self.persist_record(&record).await;
    }

    /// Commit, notify subscribers and call the update observer, skipping
    /// middleware.
    pub(crate) fn commit<T: StoreValue>(&self, record: &StoreRecord<T>, value: T) {
        let payload = serde_json::to_value(&value).ok();
        record.commit(value);

        let hook = self.inner.config.read().on_store_update.clone();
        if let Some(hook) = hook {
            hook(
                record.name(),
                payload.as_ref().unwrap_or(&serde_json::Value::Null),
            );
        }
        self.emit(StoreEvent::updated(record.name(), payload));
    }

    /// Persist the record's current value if it is persisted.
    pub(crate) async fn persist_record<T: StoreValue>(&self, record: &StoreRecord<T>) {
        if let Some(options) = record.persist_options() {
            let value = record.get();
            self.persistence()
                .persist(record.name(), &value, options)
                .await;
        }
    }

    /// Remove every persisted store from the default backend. Returns the
    /// number of keys removed.
    pub async fn clear_persisted_stores(&self) -> Result<usize> {
        let persistence = self.persistence();
        persistence.clear_all(persistence.backend().as_ref()).await
    }

    pub fn has_store(&self, name: &str) -> bool {
        self.inner.stores.read().contains_key(name)
    }

    /// Names of all registered stores, sorted.
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.stores.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn subscriber_count(&self, name: &str) -> Result<usize> {
        Ok(self.erased(name)?.subscriber_count())
    }

    pub fn is_memoized(&self, name: &str) -> Result<bool> {
        Ok(self.erased(name)?.memoize())
    }

    pub(crate) fn record<T: StoreValue>(&self, name: &str) -> Result<Arc<StoreRecord<T>>> {
        let store = self.erased(name)?;
        let found = store.type_name();
        store
            .as_any()
            .downcast::<StoreRecord<T>>()
            .map_err(|_| {
                debug!(store = %name, found, "store type mismatch");
                PulsyError::TypeMismatch {
                    name: name.to_string(),
                    expected: std::any::type_name::<T>(),
                }
            })
    }

    pub(crate) fn erased(&self, name: &str) -> Result<Arc<dyn AnyStore>> {
        self.inner
            .stores
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PulsyError::NotFound(name.to_string()))
    }

    pub(crate) fn report_error(&self, name: &str, message: String) {
        error!(store = %name, error = %message, "store write failed");
        self.emit(StoreEvent::error(name, message));
    }

    fn emit(&self, event: StoreEvent) {
        if self.inner.config.read().enable_dev_tools {
            info!(store = %event.store, kind = ?event.kind, payload = ?event.payload, "store event");
        } else {
            debug!(store = %event.store, kind = ?event.kind, "store event");
        }
        self.inner.events.send(event);
    }
}

impl Default for Pulsy {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pulsy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pulsy")
            .field("stores", &self.store_names())
            .field("config", &*self.inner.config.read())
            .finish()
    }
}
