//! Response caching handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::Result;
use crate::context::{CallShape, ResultContext, SendingContext};
use crate::handler::Handler;
use crate::registry::HandlerRegistry;
use crate::request::Request;
use crate::stage::Priority;
use crate::value::Dynamic;

/// Item key set to `true` when the call was served from the cache.
pub const CACHE_HIT: &str = "CacheHit";

/// Storage consulted by [`CacheHandler`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a live entry.
    async fn get(&self, key: &str) -> Result<Option<Dynamic>>;

    /// Store an entry with an optional time-to-live.
    async fn set(&self, key: &str, value: Dynamic, ttl: Option<Duration>) -> Result<()>;

    /// Delete an entry.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every entry.
    async fn clear(&self) -> Result<()>;
}

#[derive(Clone)]
struct CacheEntry {
    value: Dynamic,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// In-memory cache store.
#[derive(Clone, Default)]
pub struct MemoryCacheStore {
    data: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCacheStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Drop expired entries.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.data.write().retain(|_, entry| entry.is_live(now));
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Dynamic>> {
        let data = self.data.read();
        Ok(data
            .get(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Dynamic, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.data
            .write()
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.data.write().clear();
        Ok(())
    }
}

/// Serves GET calls from a [`CacheStore`].
///
/// The Sending handler (`First`) writes a cached value into the result
/// slot, which completes the call without touching the network. The Result
/// handler (`Last`) stores the final value of successful GET calls.
/// Entries are keyed by result type and URL.
#[derive(Clone)]
pub struct CacheHandler {
    store: Arc<dyn CacheStore>,
    ttl: Option<Duration>,
}

impl CacheHandler {
    /// Create a handler over `store` with entries living for `ttl`.
    pub fn new<S: CacheStore + 'static>(store: S, ttl: Option<Duration>) -> Self {
        Self::shared(Arc::new(store), ttl)
    }

    /// Create a handler over a shared store.
    pub fn shared(store: Arc<dyn CacheStore>, ttl: Option<Duration>) -> Self {
        Self { store, ttl }
    }

    /// Create a handler over a fresh in-memory store.
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(MemoryCacheStore::new(), Some(ttl))
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Register the Sending and Result handlers.
    pub fn install(self, registry: &mut HandlerRegistry) {
        let handler = Arc::new(self);
        registry
            .on::<SendingContext, _>(Priority::First, Arc::clone(&handler))
            .on::<ResultContext, _>(Priority::Last, handler);
    }

    fn key(request: &Request, shape: &CallShape) -> Option<String> {
        (*request.method() == Method::GET).then(|| format!("{} {}", shape.result, request.url()))
    }
}

#[async_trait]
impl Handler<SendingContext> for CacheHandler {
    async fn handle(&self, context: &mut SendingContext) -> Result<()> {
        if context.result().is_dirty() {
            return Ok(());
        }
        let Some(key) = Self::key(context.request(), context.call_types()) else {
            return Ok(());
        };

        match self.store.get(&key).await? {
            Some(value) => {
                tracing::debug!(key = %key, "serving call from cache");
                context.items().insert(CACHE_HIT, true);
                context.result_mut().write(value);
            }
            None => {
                context.items().insert(CACHE_HIT, false);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<ResultContext> for CacheHandler {
    async fn handle(&self, context: &mut ResultContext) -> Result<()> {
        let Some(key) = Self::key(context.request(), context.call_types()) else {
            return Ok(());
        };
        if let Some(value) = context.result().value() {
            tracing::trace!(key = %key, "caching call result");
            self.store.set(&key, value.clone(), self.ttl).await?;
        }
        Ok(())
    }
}
