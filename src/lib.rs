//! # pulsy
//!
//! Reactive in-memory stores with minimal boilerplate, meant to back UI
//! components with shared state.
//!
//! A [`Pulsy`] context owns a registry of named, typed stores:
//!
//! - **Update pipeline**: writes run through an ordered, async middleware
//!   chain, are committed and then delivered to every subscriber
//! - **Persistence**: versioned envelopes in a pluggable storage backend,
//!   with migration on version mismatch
//! - **Derived stores**: computed stores and composed stores kept fresh by
//!   subscriptions on their dependencies
//! - **Time travel**: per-consumer undo/redo over a store
//! - **Actions**: reducer-style named transitions
//!
//! ## Backends
//!
//! - [`MemoryStorage`]: In-memory backend (default)
//! - [`SqliteStorage`]: Embedded SQLite database, durable across restarts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pulsy::{Pulsy, StoreOptions};
//!
//! #[tokio::main]
//! async fn main() -> pulsy::Result<()> {
//!     let pulsy = Pulsy::new();
//!
//!     pulsy.create_store("count", 0, StoreOptions::new()).await?;
//!     let _sub = pulsy.subscribe("count", |n: &i32| println!("count is {}", n))?;
//!
//!     pulsy.update_store_value("count", |n: &i32| n + 1).await;
//!     assert_eq!(pulsy.get_store_value::<i32>("count")?, 1);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Persistence
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use pulsy::{PersistOptions, Pulsy, StoreOptions};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Settings {
//!     theme: String,
//!     #[serde(default)]
//!     font_size: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> pulsy::Result<()> {
//!     let pulsy = Pulsy::new();
//!
//!     let persist = PersistOptions::new().version(2).migrate(|old, _from| {
//!         let mut settings: Settings = serde_json::from_value(old)?;
//!         settings.font_size = 14;
//!         Ok(settings)
//!     });
//!
//!     let defaults = Settings { theme: "light".to_string(), font_size: 14 };
//!     pulsy
//!         .create_store("settings", defaults, StoreOptions::new().persist(persist))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Derived Stores
//!
//! ```rust,no_run
//! use pulsy::{Pulsy, StoreOptions, TimeTravel};
//!
//! #[tokio::main]
//! async fn main() -> pulsy::Result<()> {
//!     let pulsy = Pulsy::new();
//!     pulsy.create_store("price", 100, StoreOptions::new()).await?;
//!     pulsy.create_store("quantity", 2, StoreOptions::new()).await?;
//!
//!     pulsy
//!         .create_computed_store(
//!             "total",
//!             |pulsy: &Pulsy| {
//!                 pulsy.get_store_value::<i32>("price").unwrap_or(0)
//!                     * pulsy.get_store_value::<i32>("quantity").unwrap_or(0)
//!             },
//!             &["price", "quantity"],
//!         )
//!         .await?;
//!
//!     let history = TimeTravel::<i32>::new(&pulsy, "quantity")?;
//!     history.set(3).await;
//!     assert_eq!(pulsy.get_store_value::<i32>("total")?, 300);
//!
//!     history.undo().await;
//!     assert_eq!(pulsy.get_store_value::<i32>("total")?, 200);
//!
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod config;
pub mod derive;
pub mod error;
pub mod history;
pub mod memory;
pub mod middleware;
pub mod persist;
pub mod record;
pub mod registry;
pub mod sqlite;
pub mod storage;
pub mod watch;

// Re-export main types
pub use actions::{Action, ActionDispatcher, Actions, Handler};
pub use config::{PulsyConfig, RetentionPolicy, StoreHook, DEFAULT_NAMESPACE};
pub use derive::ComposedStore;
pub use error::{PulsyError, Result};
pub use history::TimeTravel;
pub use memory::MemoryStorage;
pub use middleware::{from_fn, BoxMiddleware, Middleware};
pub use persist::{Envelope, EnvelopeCodec, JsonCodec, Persist, PersistOptions, Persistence};
pub use record::{StoreValue, SubscriptionId};
pub use registry::{Pulsy, StoreOptions, Subscription, Update, WeakPulsy};
pub use sqlite::SqliteStorage;
pub use storage::{StorageBackend, MAX_KEY_LENGTH};
pub use watch::{EventKind, EventStream, StoreEvent};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::actions::{Action, Actions, Handler};
    pub use crate::config::{PulsyConfig, RetentionPolicy};
    pub use crate::derive::ComposedStore;
    pub use crate::error::{PulsyError, Result};
    pub use crate::history::TimeTravel;
    pub use crate::memory::MemoryStorage;
    pub use crate::middleware::{from_fn, Middleware};
    pub use crate::persist::{Persist, PersistOptions};
    pub use crate::registry::{Pulsy, StoreOptions, Subscription};
    pub use crate::sqlite::SqliteStorage;
    pub use crate::storage::StorageBackend;
    pub use crate::watch::{EventKind, StoreEvent};
}

/// Initialize logging.
///
/// Installs a tracing subscriber filtered by the `PULSY_LOG` environment
/// variable (`error`, `warn`, `info`, `debug`, `trace`), `info` when unset.
/// Call once at startup.
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("PULSY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific filter, e.g. `"pulsy=debug"`.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
