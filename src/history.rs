//! Time travel: a linear undo/redo log layered over one store.
//!
//! Each [`TimeTravel`] owns its own history and cursor. Values always reach
//! the store through its update pipeline, so ordinary subscribers see every
//! step. Writes that bypass the wrapper are not recorded and can leave the
//! cursor out of step with the store; keeping them apart is the caller's
//! job.

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::record::StoreValue;
use crate::registry::Pulsy;

#[derive(Debug, Clone)]
struct Timeline<T> {
    entries: Vec<T>,
    cursor: usize,
}

impl<T: Clone> Timeline<T> {
    fn new(initial: T) -> Self {
        Self {
            entries: vec![initial],
            cursor: 0,
        }
    }

    fn current(&self) -> &T {
        &self.entries[self.cursor]
    }

    /// Discard the redo future, then append.
    fn push(&mut self, value: T) {
        self.entries.truncate(self.cursor + 1);
        self.entries.push(value);
        self.cursor = self.entries.len() - 1;
    }

    fn back(&mut self) -> Option<T> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        Some(self.current().clone())
    }

    fn forward(&mut self) -> Option<T> {
        if self.cursor + 1 >= self.entries.len() {
            return None;
        }
        self.cursor += 1;
        Some(self.current().clone())
    }
}

/// Undo/redo wrapper over a store.
pub struct TimeTravel<T> {
    pulsy: Pulsy,
    store: String,
    timeline: Mutex<Timeline<T>>,
}

impl<T: StoreValue> TimeTravel<T> {
    /// Start a history seeded with the store's current value.
    pub fn new(pulsy: &Pulsy, store: &str) -> Result<Self> {
        let initial = pulsy.get_store_value::<T>(store)?;
        Ok(Self {
            pulsy: pulsy.clone(),
            store: store.to_string(),
            timeline: Mutex::new(Timeline::new(initial)),
        })
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    /// Record `value` and write it to the store.
    pub async fn set(&self, value: T) {
        self.timeline.lock().push(value.clone());
        self.pulsy.set_store_value(&self.store, value).await;
    }

    /// Record a function of the last value this wrapper set, and write it.
    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let value = {
            let mut timeline = self.timeline.lock();
            let value = f(timeline.current());
            timeline.push(value.clone());
            value
        };
        self.pulsy.set_store_value(&self.store, value).await;
    }

    /// Step back one entry. No-op at the start of the history.
    pub async fn undo(&self) {
        let value = self.timeline.lock().back();
        match value {
            Some(value) => self.pulsy.set_store_value(&self.store, value).await,
            None => debug!(store = %self.store, "nothing to undo"),
        }
    }

    /// Step forward one entry. No-op at the end of the history.
    pub async fn redo(&self) {
        let value = self.timeline.lock().forward();
        match value {
            Some(value) => self.pulsy.set_store_value(&self.store, value).await,
            None => debug!(store = %self.store, "nothing to redo"),
        }
    }

    pub fn can_undo(&self) -> bool {
        self.timeline.lock().cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        let timeline = self.timeline.lock();
        timeline.cursor + 1 < timeline.entries.len()
    }

    /// All recorded values, oldest first.
    pub fn history(&self) -> Vec<T> {
        self.timeline.lock().entries.clone()
    }

    pub fn cursor(&self) -> usize {
        self.timeline.lock().cursor
    }

    /// Value at the cursor.
    pub fn current(&self) -> T {
        self.timeline.lock().current().clone()
    }
}
