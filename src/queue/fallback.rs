//! Tiered fallback chains.
//!
//! Each tier is a bounded pool; a tier whose pool is full is skipped without
//! waiting. When every tier is full the request is rejected with
//! [`TurnstileError::FallbackExhausted`].

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{BoxError, TurnstileError};
use crate::work::{boxed, BoxWork};

type TierFn<T> = dyn Fn() -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync;

struct Tier<T> {
    name: String,
    permits: Arc<Semaphore>,
    run: Arc<TierFn<T>>,
}

/// An ordered chain of fallback tiers, shared across requests.
pub struct TieredFallback<T> {
    tiers: Arc<Vec<Arc<Tier<T>>>>,
}

impl<T> Clone for TieredFallback<T> {
    fn clone(&self) -> Self {
        Self {
            tiers: self.tiers.clone(),
        }
    }
}

impl<T: Send + 'static> TieredFallback<T> {
    pub fn new() -> Self {
        Self {
            tiers: Arc::new(Vec::new()),
        }
    }

    /// Append a tier allowing `max_concurrent` simultaneous executions.
    pub fn tier<F, Fut>(mut self, name: impl Into<String>, max_concurrent: usize, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let tier = Tier {
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            run: Arc::new(move || run().boxed()),
        };
        Arc::make_mut(&mut self.tiers).push(Arc::new(tier));
        self
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Run the first tier with a free slot.
    pub async fn run(&self, key: &str) -> Result<T, BoxError> {
        for tier in self.tiers.iter() {
            let permit = match tier.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(key, tier = %tier.name, "Fallback tier full, trying next");
                    continue;
                }
            };

            debug!(key, tier = %tier.name, "Running fallback tier");
            let outcome = (tier.run)().await;
            drop(permit);
            return outcome;
        }

        warn!(key, tiers = self.tiers.len(), "All fallback tiers exhausted");
        Err(TurnstileError::FallbackExhausted {
            key: key.to_string(),
            tiers: self.tiers.len(),
        }
        .into())
    }

    /// The chain as a one-shot fallback for a request on `key`.
    pub fn work_for(&self, key: &str) -> BoxWork<T> {
        let chain = self.clone();
        let key = key.to_string();
        boxed(move || async move { chain.run(&key).await })
    }
}

impl<T: Send + 'static> Default for TieredFallback<T> {
    fn default() -> Self {
        Self::new()
    }
}
