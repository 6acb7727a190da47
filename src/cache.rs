//! Discovery result caching.
//!
//! The engine memoizes whole `DiscoveryResult`s under the options
//! fingerprint. Backends are pluggable through the [`Cache`] trait;
//! [`MemoryCache`] is the in-process default.
//!
//! # Invariants
//! - TTL is enforced per entry, not globally
//! - `get` never returns an expired entry
//! - The engine holds no lock across `get`/`set`; concurrent runs may
//!   both miss and both store, and the last write wins

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::types::DiscoveryResult;

/// Default cache size (number of results).
pub const DEFAULT_CACHE_CAPACITY: u64 = 128;

/// Pluggable store for discovery results
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<Option<DiscoveryResult>>;

    async fn set(
        &self,
        ctx: &CancellationToken,
        key: &str,
        result: &DiscoveryResult,
        ttl: Duration,
    ) -> Result<()>;

    async fn delete(&self, ctx: &CancellationToken, key: &str) -> Result<()>;

    async fn clear(&self, ctx: &CancellationToken) -> Result<()>;

    async fn keys(&self, ctx: &CancellationToken) -> Result<Vec<String>>;
}

#[derive(Clone, Debug)]
struct CacheEntry {
    result: Arc<DiscoveryResult>,
    cached_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired_at(&self, now: Instant) -> bool {
        now.duration_since(self.cached_at) >= self.ttl
    }
}

/// In-memory TTL cache backed by moka
#[derive(Clone, Debug)]
pub struct MemoryCache {
    inner: MokaCache<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            inner: MokaCache::builder().max_capacity(capacity).build(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::with_capacity(config.cache_capacity)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, _ctx: &CancellationToken, key: &str) -> Result<Option<DiscoveryResult>> {
        match self.inner.get(key).await {
            Some(entry) if entry.is_expired_at(Instant::now()) => {
                trace!(key, "Cache entry expired");
                self.inner.invalidate(key).await;
                Ok(None)
            }
            Some(entry) => {
                trace!(key, "Cache hit");
                Ok(Some(entry.result.as_ref().clone()))
            }
            None => {
                trace!(key, "Cache miss");
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        _ctx: &CancellationToken,
        key: &str,
        result: &DiscoveryResult,
        ttl: Duration,
    ) -> Result<()> {
        if ttl.is_zero() {
            trace!(key, "Zero TTL, not caching");
            return Ok(());
        }

        let entry = CacheEntry {
            result: Arc::new(result.clone()),
            cached_at: Instant::now(),
            ttl,
        };
        self.inner.insert(key.to_string(), entry).await;
        trace!(key, ttl_secs = ttl.as_secs(), "Cached discovery result");
        Ok(())
    }

    async fn delete(&self, _ctx: &CancellationToken, key: &str) -> Result<()> {
        self.inner.invalidate(key).await;
        debug!(key, "Invalidated cache entry");
        Ok(())
    }

    async fn clear(&self, _ctx: &CancellationToken) -> Result<()> {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
        debug!("Invalidated all cache entries");
        Ok(())
    }

    async fn keys(&self, _ctx: &CancellationToken) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
