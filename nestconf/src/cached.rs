//! Read-through, write-through cache in front of any driver.
//!
//! ```text
//! get ──► ReadCache ──hit──► return
//!            │ miss
//!            ▼
//!         Driver ──► fill cache (unless a write raced the read)
//!
//! set/clear/increment/toggle ──► Driver ──ok──► patch cache
//!                                      └─err──► drop entries covering key
//! ```

use async_trait::async_trait;
use serde_json::{Number, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::backend::BackendKind;
use crate::cache::ReadCache;
use crate::error::Result;
use crate::path::PathKey;
use crate::traits::{sealed, Driver};

/// Driver wrapper that answers reads from a shared [`ReadCache`].
pub struct CachedDriver {
    inner: Arc<dyn Driver>,
    cache: Arc<ReadCache>,
}

impl CachedDriver {
    pub fn new(inner: Arc<dyn Driver>, cache: Arc<ReadCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<ReadCache> {
        &self.cache
    }

    /// Keep the cache consistent with the outcome of a write.
    fn settle<T>(&self, key: &PathKey, outcome: Result<T>, cached: impl FnOnce(&T) -> Value) -> Result<T> {
        match outcome {
            Ok(result) => {
                self.cache.set(key, cached(&result));
                Ok(result)
            }
            Err(e) => {
                self.cache.invalidate(key);
                Err(e)
            }
        }
    }
}

impl sealed::Sealed for CachedDriver {}

impl std::fmt::Debug for CachedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedDriver")
            .field("namespace", &self.inner.namespace())
            .field("instance_id", &self.inner.instance_id())
            .field("backend", &self.inner.backend())
            .field("cache", &self.cache)
            .finish()
    }
}

#[async_trait]
impl Driver for CachedDriver {
    fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    fn instance_id(&self) -> &str {
        self.inner.instance_id()
    }

    fn backend(&self) -> BackendKind {
        self.inner.backend()
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &PathKey) -> Result<Value> {
        let generation = self.cache.generation();
        if let Some(value) = self.cache.get(key) {
            return Ok(value);
        }
        let value = self.inner.get(key).await?;
        if !self.cache.fill(key, value.clone(), generation) {
            debug!("Write raced a cache fill; not caching");
        }
        Ok(value)
    }

    async fn set(&self, key: &PathKey, value: Value) -> Result<()> {
        let outcome = self.inner.set(key, value.clone()).await;
        self.settle(key, outcome, move |_| value)
    }

    async fn clear(&self, key: &PathKey) -> Result<()> {
        let outcome = self.inner.clear(key).await;
        if outcome.is_ok() {
            self.cache.delete(key);
        } else {
            self.cache.invalidate(key);
        }
        outcome
    }

    async fn increment(&self, key: &PathKey, delta: Number, default: Number) -> Result<Number> {
        let outcome = self.inner.increment(key, delta, default).await;
        self.settle(key, outcome, |n| Value::Number(n.clone()))
    }

    async fn toggle(&self, key: &PathKey, default: bool) -> Result<bool> {
        let outcome = self.inner.toggle(key, default).await;
        self.settle(key, outcome, |b| Value::Bool(*b))
    }
}
