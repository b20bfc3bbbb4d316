//! Middleware: value transformers in a store's write path.
//!
//! Stages run strictly in registration order, each receiving the previous
//! stage's output, and the last output is what gets committed. A stage
//! rejects a write by returning an error, which aborts the remaining stages
//! and the commit. Returning `prev` keeps the current value instead.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::error::Result;

/// A stage in a store's write path.
#[async_trait]
pub trait Middleware<T>: Send + Sync {
    /// Transform the candidate `next` value given the current `prev` value.
    async fn apply(&self, next: T, prev: T, store: &str) -> Result<T>;
}

/// Shared handle to a middleware stage.
pub type BoxMiddleware<T> = Arc<dyn Middleware<T>>;

#[async_trait]
impl<T, F, Fut> Middleware<T> for F
where
    T: Send + 'static,
    F: Fn(T, T, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    async fn apply(&self, next: T, prev: T, store: &str) -> Result<T> {
        (self)(next, prev, store.to_string()).await
    }
}

/// Middleware built from a synchronous function.
pub struct FnMiddleware<F>(F);

#[async_trait]
impl<T, F> Middleware<T> for FnMiddleware<F>
where
    T: Send + 'static,
    F: Fn(T, &T, &str) -> Result<T> + Send + Sync,
{
    async fn apply(&self, next: T, prev: T, store: &str) -> Result<T> {
        (self.0)(next, &prev, store)
    }
}

/// Adapt a synchronous function into a middleware stage.
pub fn from_fn<T, F>(f: F) -> FnMiddleware<F>
where
    F: Fn(T, &T, &str) -> Result<T> + Send + Sync,
{
    FnMiddleware(f)
}

/// Run `chain` over `candidate` in order.
pub(crate) async fn run_chain<T>(
    chain: &[BoxMiddleware<T>],
    candidate: T,
    prev: &T,
    store: &str,
) -> Result<T>
where
    T: Clone + Send + Sync + 'static,
{
    let mut value = candidate;
    for stage in chain {
        value = stage.apply(value, prev.clone(), store).await?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PulsyError;

    fn tag(suffix: &'static str) -> BoxMiddleware<String> {
        Arc::new(from_fn(move |next: String, _prev: &String, _store: &str| {
            Ok(format!("{}{}", next, suffix))
        }))
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let chain = vec![tag("-a"), tag("-b")];
        let value = run_chain(&chain, "x".to_string(), &String::new(), "s")
            .await
            .unwrap();
        assert_eq!(value, "x-a-b");
    }

    #[tokio::test]
    async fn test_async_closure_middleware() {
        let clamp: BoxMiddleware<i32> = Arc::new(|next: i32, _prev: i32, _store: String| async move {
            tokio::task::yield_now().await;
            Ok::<_, PulsyError>(next.min(10))
        });

        let value = run_chain(&[clamp], 42, &0, "n").await.unwrap();
        assert_eq!(value, 10);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_stages() {
        let reject: BoxMiddleware<String> =
            Arc::new(from_fn(|_next: String, _prev: &String, store: &str| {
                Err(PulsyError::middleware(store, "rejected"))
            }));
        let chain = vec![tag("-a"), reject, tag("-b")];

        let result = run_chain(&chain, "x".to_string(), &String::new(), "s").await;
        assert!(matches!(result, Err(PulsyError::Middleware { .. })));
    }

    #[tokio::test]
    async fn test_returning_prev_keeps_value() {
        let keep: BoxMiddleware<i32> = Arc::new(from_fn(|next: i32, prev: &i32, _store: &str| {
            Ok(if next < 0 { *prev } else { next })
        }));

        assert_eq!(run_chain(&[keep.clone()], -5, &3, "n").await.unwrap(), 3);
        assert_eq!(run_chain(&[keep], 5, &3, "n").await.unwrap(), 5);
    }
}
