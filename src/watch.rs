//! Diagnostic events emitted by the store engine.
//!
//! The engine reports store creation, updates, persistence outcomes and
//! errors on a broadcast channel unconditionally. Whether anything renders
//! or records them is up to whoever subscribes.

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;

/// What happened to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Store was registered.
    Created,
    /// A new value was committed.
    Updated,
    /// The value was written to the storage backend.
    Persisted,
    /// Writing or reading the storage backend failed.
    PersistFailed,
    /// A write was aborted (middleware failure, type mismatch).
    Error,
}

/// A diagnostic record about one store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEvent {
    /// Name of the store.
    pub store: String,
    /// What happened.
    pub kind: EventKind,
    /// Value involved, if it could be serialized.
    pub payload: Option<serde_json::Value>,
    /// Error description for failure events.
    pub message: Option<String>,
}

impl StoreEvent {
    /// Create a new Created event.
    pub fn created(store: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            store: store.into(),
            kind: EventKind::Created,
            payload,
            message: None,
        }
    }

    /// Create a new Updated event.
    pub fn updated(store: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            store: store.into(),
            kind: EventKind::Updated,
            payload,
            message: None,
        }
    }

    /// Create a new Persisted event.
    pub fn persisted(store: impl Into<String>, version: u32) -> Self {
        Self {
            store: store.into(),
            kind: EventKind::Persisted,
            payload: Some(serde_json::Value::from(version)),
            message: None,
        }
    }

    /// Create a new PersistFailed event.
    pub fn persist_failed(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            kind: EventKind::PersistFailed,
            payload: None,
            message: Some(message.into()),
        }
    }

    /// Create a new Error event.
    pub fn error(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            kind: EventKind::Error,
            payload: None,
            message: Some(message.into()),
        }
    }

    /// True for `PersistFailed` and `Error`.
    pub fn is_failure(&self) -> bool {
        matches!(self.kind, EventKind::PersistFailed | EventKind::Error)
    }
}

/// A stream of store events for a store-name pattern.
///
/// Pattern can be an exact store name or end with `*` for prefix matching.
pub struct EventStream {
    inner: BroadcastStream<StoreEvent>,
    pattern: String,
}

impl EventStream {
    /// Create a new event stream for the given pattern.
    pub fn new(receiver: broadcast::Receiver<StoreEvent>, pattern: impl Into<String>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
            pattern: pattern.into(),
        }
    }

    /// Get the pattern this stream is watching.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    fn matches(&self, store: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => store.starts_with(prefix),
            None => store == self.pattern,
        }
    }
}

impl Stream for EventStream {
    type Item = StoreEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if self.matches(&event.store) {
                        return Poll::Ready(Some(event));
                    }
                }
                // Skip lagged events
                Poll::Ready(Some(Err(_))) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Handle for broadcasting store events.
#[derive(Clone)]
pub struct EventSender {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventSender {
    /// Create a new event sender with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers.
    pub fn send(&self, event: StoreEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events.
    pub fn subscribe(&self, pattern: impl Into<String>) -> EventStream {
        EventStream::new(self.sender.subscribe(), pattern)
    }

    /// Get the number of current subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new(1024)
    }
}
