//! Validation result caches
//!
//! Entries are keyed by credential fingerprint, never by the credential.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use super::AuthCacheEntry;
use crate::Result;

/// Key-value store for validation results
#[async_trait]
pub trait AuthCache: Send + Sync {
    /// Backend label for logs and health details
    fn backend(&self) -> &'static str;

    /// Fetch an entry. Expiry is checked by the caller as well.
    async fn get(&self, fingerprint: &str) -> Result<Option<AuthCacheEntry>>;

    /// Store an entry for `ttl`
    async fn set(&self, entry: &AuthCacheEntry, ttl: Duration) -> Result<()>;

    /// Round-trip check used by health probes
    async fn ping(&self) -> Result<()>;
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuthCacheStats {
    /// Lookups answered from cache
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Expired entries removed
    pub evictions: u64,
    /// Entries currently held
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

/// In-process cache with TTL expiry
#[derive(Default)]
pub struct MemoryAuthCache {
    entries: DashMap<String, AuthCacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryAuthCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Evicted expired auth cache entries");
        }
        removed
    }

    /// Spawn periodic eviction until `shutdown` fires
    pub fn spawn_eviction(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let cache = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.evict_expired();
                    }
                    _ = shutdown.recv() => {
                        debug!("Auth cache eviction stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Current statistics
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> AuthCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        AuthCacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

#[async_trait]
impl AuthCache for MemoryAuthCache {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, fingerprint: &str) -> Result<Option<AuthCacheEntry>> {
        let Some(entry) = self.entries.get(fingerprint) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if entry.is_expired() {
            drop(entry);
            // A concurrent `set` may have refreshed the entry since the read
            if self.entries.remove_if(fingerprint, |_, e| e.is_expired()).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry.clone()))
    }

    async fn set(&self, entry: &AuthCacheEntry, ttl: Duration) -> Result<()> {
        let mut entry = entry.clone();
        entry.ttl = ttl;
        self.entries.insert(entry.credential_fingerprint.clone(), entry);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "redis-cache")]
pub use redis_cache::RedisAuthCache;

#[cfg(feature = "redis-cache")]
mod redis_cache {
    use std::time::Duration;

    use async_trait::async_trait;
    use redis::AsyncCommands;
    use redis::aio::ConnectionManager;
    use tokio::sync::OnceCell;

    use super::AuthCache;
    use crate::auth::AuthCacheEntry;
    use crate::connection::ConnectionTarget;
    use crate::{Error, Result};

    const KEY_PREFIX: &str = "depguard:auth:";

    /// Redis-backed cache: JSON values written with `SET EX`
    ///
    /// Connects lazily so that an unreachable cache never blocks startup.
    pub struct RedisAuthCache {
        dependency: String,
        client: redis::Client,
        connection: OnceCell<ConnectionManager>,
    }

    impl RedisAuthCache {
        /// Create a cache for the given dependency target
        pub fn new(dependency: &str, target: &ConnectionTarget) -> Result<Self> {
            let client = redis::Client::open(target.connection_string())
                .map_err(|e| Error::Config(format!("{dependency}: {e}")))?;
            Ok(Self {
                dependency: dependency.to_string(),
                client,
                connection: OnceCell::new(),
            })
        }

        async fn connection(&self) -> Result<ConnectionManager> {
            self.connection
                .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
                .await
                .cloned()
                .map_err(|e| self.failure(&e))
        }

        fn failure(&self, e: &redis::RedisError) -> Error {
            Error::dependency(&self.dependency, e.to_string())
        }
    }

    #[async_trait]
    impl AuthCache for RedisAuthCache {
        fn backend(&self) -> &'static str {
            "redis"
        }

        async fn get(&self, fingerprint: &str) -> Result<Option<AuthCacheEntry>> {
            let mut conn = self.connection().await?;
            let raw: Option<String> = conn
                .get(format!("{KEY_PREFIX}{fingerprint}"))
                .await
                .map_err(|e| self.failure(&e))?;
            raw.map(|json| serde_json::from_str(&json).map_err(Error::from))
                .transpose()
        }

        async fn set(&self, entry: &AuthCacheEntry, ttl: Duration) -> Result<()> {
            let mut conn = self.connection().await?;
            let json = serde_json::to_string(entry)?;
            let () = conn
                .set_ex(
                    format!("{KEY_PREFIX}{}", entry.credential_fingerprint),
                    json,
                    ttl.as_secs().max(1),
                )
                .await
                .map_err(|e| self.failure(&e))?;
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| self.failure(&e))?;
            Ok(())
        }
    }
}
