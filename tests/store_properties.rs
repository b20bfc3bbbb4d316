//! End-to-end behavior of the store engine through the public API.

use pulsy::prelude::*;
use pulsy::{Envelope, SqliteStorage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    count: i32,
    #[serde(default)]
    migrated: bool,
}

fn pulsy_over(storage: &MemoryStorage) -> Pulsy {
    Pulsy::from_parts(PulsyConfig::default(), Arc::new(storage.clone()))
}

#[tokio::test]
async fn creation_is_idempotent() {
    let pulsy = Pulsy::new();

    pulsy.create_store("s", "v1".to_string(), StoreOptions::new()).await.unwrap();
    pulsy.create_store("s", "v2".to_string(), StoreOptions::new()).await.unwrap();

    assert_eq!(pulsy.get_store_value::<String>("s").unwrap(), "v1");
}

#[tokio::test]
async fn middleware_runs_in_registration_order() {
    let pulsy = Pulsy::new();
    pulsy.create_store("s", String::new(), StoreOptions::new()).await.unwrap();

    pulsy
        .add_middleware::<String, _>(
            "s",
            from_fn(|next: String, _prev: &String, _store: &str| Ok(format!("{}-a", next))),
        )
        .unwrap();
    pulsy
        .add_middleware::<String, _>("s", |next: String, _prev: String, _store: String| async move {
            Ok(format!("{}-b", next))
        })
        .unwrap();

    pulsy.set_store_value("s", "x".to_string()).await;
    assert_eq!(pulsy.get_store_value::<String>("s").unwrap(), "x-a-b");
}

#[tokio::test]
async fn persisted_value_round_trips() {
    let storage = MemoryStorage::new();
    let pulsy = pulsy_over(&storage);

    pulsy
        .create_store(
            "s",
            Counter { count: 0, migrated: false },
            StoreOptions::new().persist(true),
        )
        .await
        .unwrap();
    pulsy
        .set_store_value("s", Counter { count: 1, migrated: false })
        .await;

    let raw = storage.get_item("pulsy_s").await.unwrap().unwrap();
    let envelope: Envelope = serde_json::from_str(&raw).unwrap();
    assert_eq!(envelope.version, 1);
    let value: Counter = serde_json::from_value(envelope.value).unwrap();
    assert_eq!(value.count, 1);
}

#[tokio::test]
async fn migration_runs_only_on_version_mismatch() {
    let storage = MemoryStorage::new();
    storage
        .set_item("pulsy_s", r#"{"value":{"count":4},"version":0}"#.to_string())
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let options = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            StoreOptions::new().persist(PersistOptions::new().version(1).migrate(
                move |raw, _from| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let mut counter: Counter = serde_json::from_value(raw)?;
                    counter.migrated = true;
                    Ok(counter)
                },
            ))
        }
    };
    let initial = Counter { count: 0, migrated: false };

    let pulsy = pulsy_over(&storage);
    pulsy.create_store("s", initial.clone(), options()).await.unwrap();
    let value = pulsy.get_store_value::<Counter>("s").unwrap();
    assert!(value.migrated);
    assert_eq!(value.count, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Same context: creation is a no-op
    pulsy.create_store("s", initial.clone(), options()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Fresh context over the same backend: stored version now matches
    let restarted = pulsy_over(&storage);
    restarted.create_store("s", initial, options()).await.unwrap();
    assert!(restarted.get_store_value::<Counter>("s").unwrap().migrated);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn computed_store_follows_dependencies() {
    let pulsy = Pulsy::new();
    pulsy.create_store("price", 100, StoreOptions::new()).await.unwrap();
    pulsy.create_store("quantity", 2, StoreOptions::new()).await.unwrap();

    pulsy
        .create_computed_store(
            "total",
            |pulsy: &Pulsy| {
                pulsy.get_store_value::<i32>("price").unwrap_or(0)
                    * pulsy.get_store_value::<i32>("quantity").unwrap_or(0)
            },
            &["price", "quantity"],
        )
        .await
        .unwrap();
    assert_eq!(pulsy.get_store_value::<i32>("total").unwrap(), 200);

    pulsy.set_store_value("quantity", 3).await;
    assert_eq!(pulsy.get_store_value::<i32>("total").unwrap(), 300);
}

#[tokio::test]
async fn derived_stores_do_not_outlive_context() {
    let pulsy = Pulsy::new();
    pulsy.create_store("price", 100, StoreOptions::new()).await.unwrap();
    pulsy.create_store("quantity", 2, StoreOptions::new()).await.unwrap();
    pulsy
        .create_computed_store(
            "total",
            |pulsy: &Pulsy| pulsy.get_store_value::<i32>("price").unwrap_or(0),
            &["price"],
        )
        .await
        .unwrap();

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Line {
        price: i32,
        quantity: i32,
    }
    let line: ComposedStore<Line> = pulsy
        .compose_stores("line", [("price", "price"), ("quantity", "quantity")])
        .await
        .unwrap();

    let context = pulsy.downgrade();
    drop(line);
    drop(pulsy);
    assert!(context.upgrade().is_none());
}

#[tokio::test]
async fn subscription_handle_detaches_on_drop() {
    let pulsy = Pulsy::new();
    pulsy.configure(|c| c.retention = RetentionPolicy::DropWhenUnsubscribed);
    pulsy.create_store("n", 0, StoreOptions::new()).await.unwrap();

    {
        let _sub = pulsy.subscribe("n", |_: &i32| {}).unwrap();
        assert_eq!(pulsy.subscriber_count("n").unwrap(), 1);
    }
    assert!(!pulsy.has_store("n"));
}

#[tokio::test]
async fn time_travel_branch_discards_redo() {
    let pulsy = Pulsy::new();
    pulsy.create_store("n", 0, StoreOptions::new()).await.unwrap();
    let history = TimeTravel::<i32>::new(&pulsy, "n").unwrap();

    history.set(1).await;
    history.set(2).await;
    assert_eq!(history.history(), vec![0, 1, 2]);
    assert_eq!(history.cursor(), 2);

    history.undo().await;
    history.undo().await;
    assert_eq!(history.cursor(), 0);
    assert_eq!(pulsy.get_store_value::<i32>("n").unwrap(), 0);

    history.set(5).await;
    assert_eq!(history.history(), vec![0, 5]);
    assert_eq!(history.cursor(), 1);

    history.redo().await;
    assert_eq!(history.cursor(), 1);
    assert_eq!(pulsy.get_store_value::<i32>("n").unwrap(), 5);
}

#[tokio::test]
async fn clear_all_leaves_unrelated_keys() {
    let storage = MemoryStorage::new();
    let pulsy = pulsy_over(&storage);

    pulsy.create_store("a", 1, StoreOptions::new().persist(true)).await.unwrap();
    pulsy.create_store("b", 2, StoreOptions::new().persist(true)).await.unwrap();
    storage.set_item("other", "external".to_string()).await.unwrap();

    pulsy.clear_persisted_stores().await.unwrap();

    assert!(!storage.contains("pulsy_a").await.unwrap());
    assert!(!storage.contains("pulsy_b").await.unwrap());
    assert_eq!(
        storage.get_item("other").await.unwrap().as_deref(),
        Some("external")
    );
}

#[tokio::test]
async fn reads_fail_but_writes_ignore_missing_stores() {
    let pulsy = Pulsy::new();

    assert!(matches!(
        pulsy.get_store_value::<i32>("ghost"),
        Err(PulsyError::NotFound(_))
    ));
    assert!(matches!(
        pulsy.subscribe("ghost", |_: &i32| {}),
        Err(PulsyError::NotFound(_))
    ));

    pulsy.set_store_value("ghost", 1).await;
    pulsy.update_store_value("ghost", |n: &i32| n + 1).await;
    assert!(!pulsy.has_store("ghost"));
}

#[tokio::test]
async fn sqlite_backend_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stores.db");

    {
        let storage = SqliteStorage::open(&path).await.unwrap();
        let pulsy = Pulsy::from_parts(PulsyConfig::default(), Arc::new(storage));
        pulsy
            .create_store("theme", "light".to_string(), StoreOptions::new().persist(true))
            .await
            .unwrap();
        pulsy.set_store_value("theme", "dark".to_string()).await;
    }

    let storage = SqliteStorage::open(&path).await.unwrap();
    let pulsy = Pulsy::from_parts(PulsyConfig::default(), Arc::new(storage));
    pulsy
        .create_store("theme", "light".to_string(), StoreOptions::new().persist(true))
        .await
        .unwrap();
    assert_eq!(pulsy.get_store_value::<String>("theme").unwrap(), "dark");
}

#[tokio::test]
async fn composed_store_with_history_and_actions() {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Cart {
        items: Vec<String>,
        discount: u32,
    }

    let pulsy = Pulsy::new();
    pulsy
        .create_store("cart.items", Vec::<String>::new(), StoreOptions::new())
        .await
        .unwrap();
    pulsy.create_store("cart.discount", 0u32, StoreOptions::new()).await.unwrap();
    let cart: ComposedStore<Cart> = pulsy
        .compose_stores("cart", [("items", "cart.items"), ("discount", "cart.discount")])
        .await
        .unwrap();

    let add: Handler<Vec<String>, String> = Arc::new(|items: &Vec<String>, action: &Action<String>| {
        let mut items = items.clone();
        items.extend(action.payload.clone());
        items
    });
    let actions = pulsy.create_actions("cart.items", vec![("add", add)]);

    let action = actions.dispatch("add", Some("apple".to_string())).await.unwrap().unwrap();
    assert_eq!(action.action_type, "add");
    assert_eq!(cart.get().unwrap().items, vec!["apple".to_string()]);

    let discount = TimeTravel::<u32>::new(&pulsy, "cart.discount").unwrap();
    discount.set(10).await;
    assert_eq!(cart.get().unwrap().discount, 10);
    discount.undo().await;
    assert_eq!(cart.get().unwrap().discount, 0);
}
