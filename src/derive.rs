//! Derived stores: computed stores and composed stores.
//!
//! Both are ordinary registry entries fed by subscriptions on other stores.
//! Their refreshes commit directly, without middleware, and are never
//! persisted. Dependencies never hear back from the stores derived from
//! them.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::error::{PulsyError, Result};
use crate::record::{AnyStore, StoreRecord, StoreValue};
use crate::registry::{Pulsy, StoreOptions, WeakPulsy};

impl Pulsy {
    /// Create a store whose value is `compute(&pulsy)`, recomputed eagerly
    /// each time one of `dependencies` commits.
    ///
    /// `compute` receives the context, so it can read its dependencies
    /// without capturing a handle that would keep the context alive.
    /// Every dependency must exist; otherwise nothing is registered and
    /// [`PulsyError::NotFound`] is returned.
    pub async fn create_computed_store<T, F>(
        &self,
        name: &str,
        compute: F,
        dependencies: &[&str],
    ) -> Result<()>
    where
        T: StoreValue,
        F: Fn(&Pulsy) -> T + Send + Sync + 'static,
    {
        let deps = dependencies
            .iter()
            .map(|dep| self.erased(dep))
            .collect::<Result<Vec<_>>>()?;

        if !self.install(name, compute(self), StoreOptions::new(), false).await? {
            return Ok(());
        }
        let record = self.record::<T>(name)?;

        let compute = Arc::new(compute);
        for dep in &deps {
            let weak = self.downgrade();
            let target = Arc::downgrade(&record);
            let compute = Arc::clone(&compute);
            let id = dep.subscribe_change(Arc::new(move || {
                let (Some(pulsy), Some(record)) = (weak.upgrade(), target.upgrade()) else {
                    return;
                };
                let value = compute(&pulsy);
                pulsy.commit(&record, value);
            }));
            record.track_dependency(dep, id);
        }

        debug!(store = %name, dependencies = ?dependencies, "computed store registered");
        Ok(())
    }

    /// Create an aggregate store over existing stores.
    ///
    /// `fields` maps each logical field name to a constituent store name.
    /// The aggregate is the JSON object of constituent values decoded into
    /// `T`; it is republished whenever a constituent commits a value that
    /// differs from its last snapshot.
    ///
    /// If `name` is already a composed store of type `T`, the returned
    /// handle carries that store's existing wiring and `fields` is ignored.
    /// Any other store under `name` is a [`PulsyError::Configuration`]
    /// error.
    pub async fn compose_stores<T, K, V, I>(&self, name: &str, fields: I) -> Result<ComposedStore<T>>
    where
        T: StoreValue,
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        if self.has_store(name) {
            warn!(store = %name, "store already exists, keeping current wiring");
            return self.composed_handle(name);
        }

        let fields: BTreeMap<String, String> = fields
            .into_iter()
            .map(|(field, store)| (field.into(), store.into()))
            .collect();

        let mut constituents = Vec::with_capacity(fields.len());
        let mut snapshot = Map::new();
        for (field, store_name) in &fields {
            let store = self.erased(store_name)?;
            snapshot.insert(field.clone(), store.snapshot_json()?);
            constituents.push((field.clone(), store));
        }

        let aggregate: T = serde_json::from_value(Value::Object(snapshot.clone()))?;
        if !self.install(name, aggregate, StoreOptions::new(), false).await? {
            return self.composed_handle(name);
        }

        let record = self.record::<T>(name)?;
        record.set_composition(fields.clone());
        let refresh = Arc::new(Recombine {
            pulsy: self.downgrade(),
            record: Arc::downgrade(&record),
            constituents: constituents
                .iter()
                .map(|(field, store)| (field.clone(), Arc::downgrade(store)))
                .collect(),
            snapshot: Mutex::new(snapshot),
        });
        for (_, store) in &constituents {
            let refresh = Arc::clone(&refresh);
            let id = store.subscribe_change(Arc::new(move || refresh.run()));
            record.track_dependency(store, id);
        }
        debug!(store = %name, fields = ?fields, "composed store registered");

        Ok(ComposedStore {
            pulsy: self.clone(),
            name: name.to_string(),
            fields,
            _marker: PhantomData,
        })
    }

    /// Handle over an already registered composed store.
    fn composed_handle<T: StoreValue>(&self, name: &str) -> Result<ComposedStore<T>> {
        let record = self.record::<T>(name)?;
        let fields = record.composition().cloned().ok_or_else(|| {
            PulsyError::Configuration(format!("store '{}' exists and is not composed", name))
        })?;

        Ok(ComposedStore {
            pulsy: self.clone(),
            name: name.to_string(),
            fields,
            _marker: PhantomData,
        })
    }
}

/// Diff-and-recombine step shared by a composed store's subscriptions.
///
/// Holds only weak handles: constituents own this step through their
/// subscriber maps.
struct Recombine<T> {
    pulsy: WeakPulsy,
    record: Weak<StoreRecord<T>>,
    constituents: Vec<(String, Weak<dyn AnyStore>)>,
    snapshot: Mutex<Map<String, Value>>,
}

impl<T: StoreValue> Recombine<T> {
    fn run(&self) {
        let (Some(pulsy), Some(record)) = (self.pulsy.upgrade(), self.record.upgrade()) else {
            return;
        };

        let aggregate = {
            let mut snapshot = self.snapshot.lock();
            let mut changed = false;
            for (field, store) in &self.constituents {
                let Some(store) = store.upgrade() else {
                    continue;
                };
                let current = match store.snapshot_json() {
                    Ok(current) => current,
                    Err(e) => {
                        pulsy.report_error(record.name(), e.to_string());
                        return;
                    }
                };
                if snapshot.get(field) != Some(&current) {
                    snapshot.insert(field.clone(), current);
                    changed = true;
                }
            }
            if !changed {
                return;
            }
            serde_json::from_value::<T>(Value::Object(snapshot.clone()))
        };

        match aggregate {
            Ok(aggregate) => pulsy.commit(&record, aggregate),
            Err(e) => pulsy.report_error(record.name(), e.to_string()),
        }
    }
}

/// Handle to a composed store.
///
/// Writes never touch the aggregate directly: each field is written to its
/// constituent store, whose commit then refreshes the aggregate.
pub struct ComposedStore<T> {
    pulsy: Pulsy,
    name: String,
    fields: BTreeMap<String, String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StoreValue> ComposedStore<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical field name to constituent store name.
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Current aggregate value.
    pub fn get(&self) -> Result<T> {
        self.pulsy.get_store_value(&self.name)
    }

    /// Forward each field of `partial` to its constituent store. Unknown
    /// fields are skipped with a warning.
    pub async fn set(&self, partial: Map<String, Value>) {
        for (field, value) in partial {
            let Some(store_name) = self.fields.get(&field) else {
                warn!(store = %self.name, field = %field, "unknown composed field");
                continue;
            };
            match self.pulsy.erased(store_name) {
                Ok(store) => store.set_json(&self.pulsy, value).await,
                Err(_) => debug!(store = %store_name, "ignoring write to unknown store"),
            }
        }
    }

    /// Write one field through its constituent store's pipeline.
    pub async fn set_field<V: StoreValue>(&self, field: &str, value: V) -> Result<()> {
        let store_name = self
            .fields
            .get(field)
            .ok_or_else(|| PulsyError::NotFound(format!("{}.{}", self.name, field)))?;
        self.pulsy.set_store_value(store_name, value).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PulsyConfig, RetentionPolicy};
    use crate::middleware::from_fn;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn cart(pulsy: &Pulsy) {
        pulsy.create_store("price", 100, StoreOptions::new()).await.unwrap();
        pulsy.create_store("quantity", 2, StoreOptions::new()).await.unwrap();
    }

    fn total(pulsy: &Pulsy) -> i32 {
        pulsy.get_store_value::<i32>("price").unwrap_or(0)
            * pulsy.get_store_value::<i32>("quantity").unwrap_or(0)
    }

    #[tokio::test]
    async fn test_computed_recomputes_on_dependency_commit() {
        let pulsy = Pulsy::new();
        cart(&pulsy).await;

        pulsy
            .create_computed_store("total", total, &["price", "quantity"])
            .await
            .unwrap();
        assert_eq!(pulsy.get_store_value::<i32>("total").unwrap(), 200);

        pulsy.set_store_value("quantity", 3).await;
        assert_eq!(pulsy.get_store_value::<i32>("total").unwrap(), 300);

        pulsy.set_store_value("price", 10).await;
        assert_eq!(pulsy.get_store_value::<i32>("total").unwrap(), 30);
    }

    #[tokio::test]
    async fn test_computed_missing_dependency() {
        let pulsy = Pulsy::new();
        let result = pulsy
            .create_computed_store("total", |_: &Pulsy| 0, &["missing"])
            .await;

        assert!(matches!(result, Err(PulsyError::NotFound(_))));
        assert!(!pulsy.has_store("total"));
    }

    #[tokio::test]
    async fn test_computed_bypasses_middleware() {
        let pulsy = Pulsy::new();
        pulsy.create_store("n", 1, StoreOptions::new()).await.unwrap();

        pulsy
            .create_computed_store(
                "double",
                |pulsy: &Pulsy| pulsy.get_store_value::<i32>("n").unwrap_or(0) * 2,
                &["n"],
            )
            .await
            .unwrap();
        pulsy
            .add_middleware::<i32, _>("double", from_fn(|_next: i32, _prev: &i32, _store: &str| Ok(-1)))
            .unwrap();

        pulsy.set_store_value("n", 5).await;
        assert_eq!(pulsy.get_store_value::<i32>("double").unwrap(), 10);
    }

    #[tokio::test]
    async fn test_computed_subscribers_notified() {
        let pulsy = Pulsy::new();
        cart(&pulsy).await;

        pulsy
            .create_computed_store("total", total, &["price", "quantity"])
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let _sub = pulsy
            .subscribe("total", move |_: &i32| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        pulsy.set_store_value("quantity", 5).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        age: u32,
    }

    async fn profile(pulsy: &Pulsy) -> ComposedStore<Profile> {
        pulsy
            .create_store("user.name", "Ada".to_string(), StoreOptions::new())
            .await
            .unwrap();
        pulsy.create_store("user.age", 36u32, StoreOptions::new()).await.unwrap();
        pulsy
            .compose_stores("profile", [("name", "user.name"), ("age", "user.age")])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_compose_initial_aggregate() {
        let pulsy = Pulsy::new();
        let composed = profile(&pulsy).await;

        assert_eq!(
            composed.get().unwrap(),
            Profile {
                name: "Ada".to_string(),
                age: 36
            }
        );
    }

    #[tokio::test]
    async fn test_compose_refreshes_on_constituent_commit() {
        let pulsy = Pulsy::new();
        let composed = profile(&pulsy).await;

        pulsy.set_store_value("user.age", 37u32).await;
        assert_eq!(composed.get().unwrap().age, 37);
    }

    #[tokio::test]
    async fn test_compose_writes_through_constituents() {
        let pulsy = Pulsy::new();
        let composed = profile(&pulsy).await;

        let mut partial = Map::new();
        partial.insert("name".to_string(), Value::from("Grace"));
        partial.insert("unknown".to_string(), Value::from(1));
        composed.set(partial).await;

        assert_eq!(pulsy.get_store_value::<String>("user.name").unwrap(), "Grace");
        assert_eq!(composed.get().unwrap().name, "Grace");

        composed.set_field("age", 40u32).await.unwrap();
        assert_eq!(pulsy.get_store_value::<u32>("user.age").unwrap(), 40);
        assert_eq!(composed.get().unwrap().age, 40);

        assert!(composed.set_field("missing", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_compose_skips_unchanged_constituents() {
        let pulsy = Pulsy::new();
        let _composed = profile(&pulsy).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let _sub = pulsy
            .subscribe("profile", move |_: &Profile| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        pulsy.set_store_value("user.age", 36u32).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        pulsy.set_store_value("user.age", 50u32).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compose_missing_constituent() {
        let pulsy = Pulsy::new();
        let result = pulsy
            .compose_stores::<Profile, _, _, _>("profile", [("name", "nope")])
            .await;
        assert!(matches!(result, Err(PulsyError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_computed_store_does_not_keep_context_alive() {
        let pulsy = Pulsy::new();
        cart(&pulsy).await;
        pulsy
            .create_computed_store("total", total, &["price", "quantity"])
            .await
            .unwrap();

        let context = pulsy.downgrade();
        drop(pulsy);
        assert!(context.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_composed_constituents_freed_with_context() {
        let pulsy = Pulsy::new();
        let composed = profile(&pulsy).await;
        let constituent = Arc::downgrade(&pulsy.erased("user.name").unwrap());
        let aggregate = Arc::downgrade(&pulsy.erased("profile").unwrap());

        let context = pulsy.downgrade();
        drop(composed);
        drop(pulsy);

        assert!(context.upgrade().is_none());
        assert!(constituent.upgrade().is_none());
        assert!(aggregate.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_dropped_computed_store_releases_dependencies() {
        let updates = Arc::new(AtomicUsize::new(0));
        let updates_clone = updates.clone();
        let config = PulsyConfig {
            retention: RetentionPolicy::DropWhenUnsubscribed,
            ..PulsyConfig::default()
        }
        .on_store_update(move |name, _| {
            if name == "double" {
                updates_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        let pulsy = Pulsy::with_config(config);
        pulsy.create_store("n", 1, StoreOptions::new()).await.unwrap();

        let double = |pulsy: &Pulsy| pulsy.get_store_value::<i32>("n").unwrap_or(0) * 2;
        pulsy.create_computed_store("double", double, &["n"]).await.unwrap();
        assert_eq!(pulsy.subscriber_count("n").unwrap(), 1);

        pulsy.subscribe("double", |_: &i32| {}).unwrap().unsubscribe();
        assert!(!pulsy.has_store("double"));
        assert_eq!(pulsy.subscriber_count("n").unwrap(), 0);

        pulsy.create_computed_store("double", double, &["n"]).await.unwrap();
        pulsy.set_store_value("n", 5).await;

        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(pulsy.subscriber_count("n").unwrap(), 1);
        assert_eq!(pulsy.get_store_value::<i32>("double").unwrap(), 10);
    }

    #[tokio::test]
    async fn test_dropped_composed_store_releases_constituents() {
        let pulsy = Pulsy::new();
        pulsy.configure(|c| c.retention = RetentionPolicy::DropWhenUnsubscribed);
        let _composed = profile(&pulsy).await;
        assert_eq!(pulsy.subscriber_count("user.age").unwrap(), 1);

        pulsy.subscribe("profile", |_: &Profile| {}).unwrap().unsubscribe();
        assert!(!pulsy.has_store("profile"));
        assert_eq!(pulsy.subscriber_count("user.name").unwrap(), 0);
        assert_eq!(pulsy.subscriber_count("user.age").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_compose_existing_name_keeps_wiring() {
        let pulsy = Pulsy::new();
        let composed = profile(&pulsy).await;

        let again = pulsy
            .compose_stores::<Profile, _, _, _>("profile", [("name", "user.age")])
            .await
            .unwrap();
        assert_eq!(again.fields(), composed.fields());

        again.set_field("age", 41u32).await.unwrap();
        assert_eq!(composed.get().unwrap().age, 41);
    }

    #[tokio::test]
    async fn test_compose_over_plain_store_fails() {
        let pulsy = Pulsy::new();
        let composed = profile(&pulsy).await;
        pulsy
            .create_store("plain", composed.get().unwrap(), StoreOptions::new())
            .await
            .unwrap();

        let result = pulsy
            .compose_stores::<Profile, _, _, _>("plain", [("name", "user.name")])
            .await;
        assert!(matches!(result, Err(PulsyError::Configuration(_))));

        let result = pulsy
            .compose_stores::<String, _, _, _>("profile", [("name", "user.name")])
            .await;
        assert!(matches!(result, Err(PulsyError::TypeMismatch { .. })));
    }
}
