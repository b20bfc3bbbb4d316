//! Action dispatch: named reducer-style transitions bound to a store.
//!
//! Dispatching builds an [`Action`], runs the handler registered for its
//! type against the current value and commits the result directly, without
//! middleware. The action itself is returned so callers can log or forward
//! it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::record::StoreValue;
use crate::registry::Pulsy;

/// A tagged state transition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action<P> {
    #[serde(rename = "type")]
    pub action_type: String,
    pub payload: Option<P>,
}

/// Reducer for one action type.
pub type Handler<T, P> = Arc<dyn Fn(&T, &Action<P>) -> T + Send + Sync>;

/// Dispatcher for a single action type.
pub struct ActionDispatcher<T, P> {
    pulsy: Pulsy,
    store: String,
    action_type: String,
    handler: Handler<T, P>,
}

impl<T, P> ActionDispatcher<T, P>
where
    T: StoreValue,
    P: Clone + Send + Sync + 'static,
{
    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    /// Apply the handler to the store's current value and commit the result.
    ///
    /// Fails with `NotFound` if the store does not exist.
    pub async fn dispatch(&self, payload: Option<P>) -> Result<Action<P>> {
        let record = self.pulsy.record::<T>(&self.store)?;
        let action = Action {
            action_type: self.action_type.clone(),
            payload,
        };

        let state = record.get();
        let next = (self.handler)(&state, &action);
        self.pulsy.commit(&record, next);
        self.pulsy.persist_record(&record).await;

        debug!(store = %self.store, action = %self.action_type, "action dispatched");
        Ok(action)
    }
}

/// The dispatchers created for one store, keyed by action type.
pub struct Actions<T, P> {
    dispatchers: BTreeMap<String, ActionDispatcher<T, P>>,
}

impl<T, P> Actions<T, P>
where
    T: StoreValue,
    P: Clone + Send + Sync + 'static,
{
    pub fn get(&self, action_type: &str) -> Option<&ActionDispatcher<T, P>> {
        self.dispatchers.get(action_type)
    }

    /// Dispatch by type name. Unknown types yield `None`.
    pub async fn dispatch(&self, action_type: &str, payload: Option<P>) -> Option<Result<Action<P>>> {
        match self.dispatchers.get(action_type) {
            Some(dispatcher) => Some(dispatcher.dispatch(payload).await),
            None => None,
        }
    }

    pub fn action_types(&self) -> impl Iterator<Item = &str> {
        self.dispatchers.keys().map(String::as_str)
    }
}

impl Pulsy {
    /// Bind reducer-style handlers to `store`, one dispatcher per action
    /// type.
    pub fn create_actions<T, P, K, I>(&self, store: &str, handlers: I) -> Actions<T, P>
    where
        T: StoreValue,
        P: Clone + Send + Sync + 'static,
        K: Into<String>,
        I: IntoIterator<Item = (K, Handler<T, P>)>,
    {
        let dispatchers = handlers
            .into_iter()
            .map(|(action_type, handler)| {
                let action_type = action_type.into();
                let dispatcher = ActionDispatcher {
                    pulsy: self.clone(),
                    store: store.to_string(),
                    action_type: action_type.clone(),
                    handler,
                };
                (action_type, dispatcher)
            })
            .collect();

        Actions { dispatchers }
    }
}
