//! Store records: the single backing slot of each named store.
//!
//! A record owns the current value, the middleware chain and the
//! subscribers. Records are typed; the registry keeps them behind
//! [`AnyStore`] so stores of different value types can share one map.
//!
//! No lock is held while subscribers or middleware run, so callbacks may
//! read or write other stores.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::error::Result;
use crate::middleware::BoxMiddleware;
use crate::persist::PersistOptions;
use crate::registry::Pulsy;

/// Bounds every stored value satisfies.
pub trait StoreValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Callback invoked with each committed value.
pub type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Callback invoked after each commit, without the value.
pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

/// Identity of one subscription within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Backing record of a typed store.
pub struct StoreRecord<T> {
    name: String,
    value: RwLock<T>,
    middleware: RwLock<Vec<BoxMiddleware<T>>>,
    subscribers: RwLock<BTreeMap<SubscriptionId, Subscriber<T>>>,
    next_subscription: AtomicU64,
    memoize: bool,
    persist: Option<PersistOptions<T>>,
    /// Subscriptions this record holds on the stores it is derived from.
    dependencies: Mutex<Vec<(Weak<dyn AnyStore>, SubscriptionId)>>,
    /// Field to constituent mapping, set once for composed stores.
    composition: OnceLock<BTreeMap<String, String>>,
}

impl<T: StoreValue> StoreRecord<T> {
    pub(crate) fn new(
        name: impl Into<String>,
        value: T,
        middleware: Vec<BoxMiddleware<T>>,
        memoize: bool,
        persist: Option<PersistOptions<T>>,
    ) -> Self {
        Self {
            name: name.into(),
            value: RwLock::new(value),
            middleware: RwLock::new(middleware),
            subscribers: RwLock::new(BTreeMap::new()),
            next_subscription: AtomicU64::new(1),
            memoize,
            persist,
            dependencies: Mutex::new(Vec::new()),
            composition: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clone of the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    pub fn memoize(&self) -> bool {
        self.memoize
    }

    /// Resolved persistence settings, `None` when not persisted.
    pub fn persist_options(&self) -> Option<&PersistOptions<T>> {
        self.persist.as_ref()
    }

    pub(crate) fn add_middleware(&self, stage: BoxMiddleware<T>) {
        self.middleware.write().push(stage);
    }

    /// Chain as of now; later additions do not affect a running write.
    pub(crate) fn middleware_snapshot(&self) -> Vec<BoxMiddleware<T>> {
        self.middleware.read().clone()
    }

    pub fn subscribe(&self, subscriber: Subscriber<T>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().insert(id, subscriber);
        id
    }

    /// Remove a subscription. Returns the number of subscribers left.
    pub fn unsubscribe(&self, id: SubscriptionId) -> usize {
        let mut subscribers = self.subscribers.write();
        subscribers.remove(&id);
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Remember a subscription on `dependency` so it can be released when
    /// this record leaves the registry.
    pub(crate) fn track_dependency(&self, dependency: &Arc<dyn AnyStore>, id: SubscriptionId) {
        self.dependencies.lock().push((Arc::downgrade(dependency), id));
    }

    pub(crate) fn set_composition(&self, fields: BTreeMap<String, String>) {
        let _ = self.composition.set(fields);
    }

    /// Field wiring of a composed store, `None` for every other store.
    pub fn composition(&self) -> Option<&BTreeMap<String, String>> {
        self.composition.get()
    }

    /// Assign `value` and invoke every subscriber exactly once with it.
    pub(crate) fn commit(&self, value: T) {
        *self.value.write() = value.clone();

        let subscribers: Vec<Subscriber<T>> = self.subscribers.read().values().cloned().collect();
        for subscriber in subscribers {
            subscriber(&value);
        }
    }
}

/// Type-erased view of a [`StoreRecord`].
#[async_trait]
pub trait AnyStore: Send + Sync {
    fn name(&self) -> &str;

    fn type_name(&self) -> &'static str;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Current value as JSON.
    fn snapshot_json(&self) -> Result<serde_json::Value>;

    fn subscribe_change(&self, listener: ChangeListener) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> usize;

    fn subscriber_count(&self) -> usize;

    fn memoize(&self) -> bool;

    /// Drop the subscriptions held on dependency stores. Returns how many
    /// were still live.
    fn release_dependencies(&self) -> usize;

    /// Decode `value` into the store's type and write it through the
    /// update pipeline of `pulsy`.
    async fn set_json(&self, pulsy: &Pulsy, value: serde_json::Value);
}

#[async_trait]
impl<T: StoreValue> AnyStore for StoreRecord<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn snapshot_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&*self.value.read())?)
    }

    fn subscribe_change(&self, listener: ChangeListener) -> SubscriptionId {
        self.subscribe(Arc::new(move |_: &T| listener()))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> usize {
        StoreRecord::unsubscribe(self, id)
    }

    fn subscriber_count(&self) -> usize {
        StoreRecord::subscriber_count(self)
    }

    fn memoize(&self) -> bool {
        self.memoize
    }

    fn release_dependencies(&self) -> usize {
        let dependencies = std::mem::take(&mut *self.dependencies.lock());
        let mut released = 0;
        for (dependency, id) in dependencies {
            if let Some(dependency) = dependency.upgrade() {
                dependency.unsubscribe(id);
                released += 1;
            }
        }
        released
    }

    async fn set_json(&self, pulsy: &Pulsy, value: serde_json::Value) {
        match serde_json::from_value::<T>(value) {
            Ok(value) => pulsy.set_store_value(&self.name, value).await,
            Err(e) => pulsy.report_error(&self.name, format!("cannot decode value: {}", e)),
        }
    }
}
