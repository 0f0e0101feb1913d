//! Remote-first, fallback-second cache orchestrator.
//!
//! Reads try the remote store when a connection is available and fall
//! through to the in-process fallback store on any absence, error or
//! timeout. Writes go to exactly one tier: the remote store when it accepts
//! the write, the fallback store otherwise. The two tiers are independent
//! best-effort layers and are never kept in sync.
//!
//! Both tiers expire on whole seconds with a one second floor, so an entry
//! lives equally long whichever tier took it.
//!
//! Remote failures never reach the caller. Only malformed input (an invalid
//! subject) and values that cannot be encoded or decoded are reported as
//! errors.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forecache_core::{
    CacheConfig, CacheError, CacheKey, CacheMode, CacheResult, Clock, KeyDeriver, KeyParams,
    RemoteError, RemoteResult, SystemClock, TtlPolicy,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::connection::{ConnectionManager, ConnectionSettings, ConnectionState};
use super::fallback::FallbackStore;
use super::traits::{
    ArtifactSource, KeyListing, RemoteConnector, RemoteInfo, RemoteStore, StatsSnapshot, Tier,
};

/// Hit, miss and failure counters, reported through [`StatsSnapshot`].
#[derive(Debug, Default)]
struct TierCounters {
    remote_hits: AtomicU64,
    fallback_hits: AtomicU64,
    misses: AtomicU64,
    remote_errors: AtomicU64,
}

impl TierCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The public cache service.
///
/// Construct one per process and share it (for example behind an `Arc`).
/// The remote connection and the fallback map live inside it.
///
/// # Example
///
/// ```ignore
/// let cache = TieredCache::new(RedisConnector::from_config(&config)?, &config)?;
///
/// let key = cache.derive_key("42", &KeyParams::new().with("days", 30))?;
/// if let Some(forecast) = cache.get::<Forecast>(&key).await? {
///     return Ok(forecast);
/// }
/// let forecast = compute_forecast(42, 30).await?;
/// cache.set(&key, &forecast, cache.ttl_for(30)).await?;
/// ```
pub struct TieredCache<C: RemoteConnector> {
    connection: ConnectionManager<C>,
    fallback: FallbackStore,
    keys: KeyDeriver,
    ttl_policy: TtlPolicy,
    operation_timeout: Duration,
    counters: TierCounters,
}

impl<C: RemoteConnector> TieredCache<C> {
    /// Create a cache over `connector` using the system clock.
    pub fn new(connector: C, config: &CacheConfig) -> CacheResult<Self> {
        Self::with_clock(connector, config, Arc::new(SystemClock))
    }

    /// Create a cache whose fallback expiry and reconnect cooldowns read `clock`.
    pub fn with_clock(
        connector: C,
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> CacheResult<Self> {
        config.validate()?;
        let settings = ConnectionSettings {
            connect_timeout: config.connect_timeout(),
            max_attempts: config.max_connection_attempts,
            reconnect: config.reconnect,
            enabled: config.mode == CacheMode::Remote,
        };

        tracing::info!(
            mode = ?config.mode,
            endpoint = %connector.describe(),
            fallback_capacity = config.fallback_capacity,
            "Cache initialized"
        );

        Ok(Self {
            connection: ConnectionManager::new(connector, settings, Arc::clone(&clock)),
            fallback: FallbackStore::new(config.fallback_capacity, clock),
            keys: KeyDeriver::new(config.namespace.clone())?,
            ttl_policy: config.ttl,
            operation_timeout: config.operation_timeout(),
            counters: TierCounters::default(),
        })
    }

    /// Derive the key for `subject` and `params` in this cache's namespace.
    pub fn derive_key(&self, subject: &str, params: &KeyParams) -> CacheResult<CacheKey> {
        self.keys.derive(subject, params)
    }

    /// Lifetime for an artifact covering `horizon_days`.
    pub fn ttl_for(&self, horizon_days: i64) -> Duration {
        self.ttl_policy.ttl_for(horizon_days)
    }

    pub fn key_deriver(&self) -> &KeyDeriver {
        &self.keys
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Look `key` up in the remote tier, then the fallback tier.
    ///
    /// Returns `Ok(None)` when both tiers miss. A stored value that does not
    /// decode as `T` is an error.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> CacheResult<Option<T>> {
        if let Some(raw) = self.remote_get(key).await {
            TierCounters::bump(&self.counters.remote_hits);
            tracing::debug!(key = %key, tier = "remote", "Cache hit");
            return decode(&raw).map(Some);
        }

        if let Some(raw) = self.fallback.get(key.as_str()) {
            TierCounters::bump(&self.counters.fallback_hits);
            tracing::debug!(key = %key, tier = "fallback", "Cache hit");
            return decode(&raw).map(Some);
        }

        TierCounters::bump(&self.counters.misses);
        tracing::debug!(key = %key, "Cache miss");
        Ok(None)
    }

    /// Store `value` under `key` for `ttl`.
    ///
    /// The remote tier is tried first; the fallback tier is written only when
    /// the remote tier is unavailable or rejects the write. A remote write
    /// drops any older fallback copy so it cannot resurface later. `ttl` is
    /// truncated to whole seconds, minimum one.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<()> {
        let payload = serde_json::to_string(value)?;
        let ttl = normalize_ttl(ttl);

        if let Some(store) = self.connection.handle().await {
            let written = self
                .bounded("set", store.set_with_expiry(key.as_str(), &payload, ttl))
                .await;
            if written.is_some() {
                self.fallback.remove(key.as_str());
                tracing::debug!(key = %key, tier = "remote", ttl_secs = ttl.as_secs(), "Cache write");
                return Ok(());
            }
        }

        self.fallback.set(key.as_str(), payload, ttl);
        tracing::debug!(key = %key, tier = "fallback", ttl_secs = ttl.as_secs(), "Cache write");
        Ok(())
    }

    /// Remove every entry for `subject` from both tiers.
    ///
    /// Removes the bare `namespace:subject` key and every key under
    /// `namespace:subject:`, and never touches another subject that merely
    /// shares a prefix. Returns the total removed across both tiers.
    pub async fn invalidate(&self, subject: &str) -> CacheResult<u64> {
        let scope = self.keys.scope(subject)?;

        let mut remote_removed = 0;
        if let Some(store) = self.connection.handle().await {
            let mut keys = self
                .bounded("scan", store.scan(&scope.remote_pattern()))
                .await
                .unwrap_or_default();
            keys.push(scope.exact_key().to_string());
            keys.sort_unstable();
            keys.dedup();
            remote_removed = self
                .bounded("delete", store.delete(&keys))
                .await
                .unwrap_or(0);
        }

        let fallback_removed = self.fallback.invalidate(&scope);
        if remote_removed + fallback_removed > 0 {
            tracing::info!(
                subject,
                remote_removed,
                fallback_removed,
                "Invalidated cache entries"
            );
        }
        Ok(remote_removed + fallback_removed)
    }

    /// Fresh snapshot of connection state, tier sizes and counters.
    pub async fn stats(&self) -> StatsSnapshot {
        let info: Option<RemoteInfo> = match self.connection.handle().await {
            Some(store) => self.bounded("info", store.info()).await,
            None => None,
        };

        StatsSnapshot {
            remote_connected: info.is_some(),
            connection_state: self.connection.state(),
            connection_attempts: self.connection.failed_attempts(),
            fallback_size: self.fallback.len(),
            fallback_capacity: self.fallback.capacity(),
            remote_key_count: info.as_ref().map(|i| i.key_count),
            remote_memory_used: info.and_then(|i| i.memory_used),
            remote_hits: self.counters.remote_hits.load(Ordering::Relaxed),
            fallback_hits: self.counters.fallback_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            remote_errors: self.counters.remote_errors.load(Ordering::Relaxed),
        }
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    ///
    /// Concurrent misses on the same key each call `source`; the later write wins.
    pub async fn get_or_compute<T, S>(&self, key: &CacheKey, ttl: Duration, source: &S) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        S: ArtifactSource<T> + ?Sized,
    {
        if let Some(cached) = self.get::<T>(key).await? {
            return Ok(cached);
        }
        self.refresh(key, ttl, source).await
    }

    /// Compute a fresh value for `key` and store it, ignoring anything cached.
    pub async fn refresh<T, S>(&self, key: &CacheKey, ttl: Duration, source: &S) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        S: ArtifactSource<T> + ?Sized,
    {
        let artifact = source.compute(key).await?;
        self.set(key, &artifact, ttl).await?;
        Ok(artifact)
    }

    /// Every live key in the namespace, from both tiers, sorted by key.
    ///
    /// A key present in both tiers is listed once per tier. Remote lifetimes
    /// are omitted once a lookup fails.
    pub async fn keys(&self) -> Vec<KeyListing> {
        let mut listing = Vec::new();

        if let Some(store) = self.connection.handle().await {
            let found = self
                .bounded("scan", store.scan(&self.keys.namespace_pattern()))
                .await
                .unwrap_or_default();
            let mut lookups_ok = true;
            for key in found {
                let mut ttl_secs = None;
                if lookups_ok {
                    match self.bounded("ttl", store.ttl(&key)).await {
                        Some(remaining) => ttl_secs = remaining.map(|d| d.as_secs()),
                        None => lookups_ok = false,
                    }
                }
                listing.push(KeyListing {
                    key,
                    tier: Tier::Remote,
                    ttl_secs,
                });
            }
        }

        let prefix = self.keys.namespace_prefix();
        listing.extend(
            self.fallback
                .live_entries(&prefix)
                .into_iter()
                .map(|(key, remaining)| KeyListing {
                    key,
                    tier: Tier::Fallback,
                    ttl_secs: Some(remaining.as_secs()),
                }),
        );
        listing.sort_by(|a, b| a.key.cmp(&b.key));
        listing
    }

    /// Remove `key` from both tiers, returning how many copies existed.
    pub async fn delete(&self, key: &CacheKey) -> u64 {
        let mut removed = 0;
        if let Some(store) = self.connection.handle().await {
            removed = self
                .bounded("delete", store.delete(&[key.to_string()]))
                .await
                .unwrap_or(0);
        }
        if self.fallback.remove(key.as_str()) {
            removed += 1;
        }
        tracing::info!(key = %key, removed, "Deleted cache key");
        removed
    }

    /// Remove every key in the namespace from both tiers.
    ///
    /// Keys outside the namespace are never touched.
    pub async fn clear(&self) -> u64 {
        let mut remote_removed = 0;
        if let Some(store) = self.connection.handle().await {
            let keys = self
                .bounded("scan", store.scan(&self.keys.namespace_pattern()))
                .await
                .unwrap_or_default();
            if !keys.is_empty() {
                remote_removed = self
                    .bounded("delete", store.delete(&keys))
                    .await
                    .unwrap_or(0);
            }
        }

        let fallback_removed = self.fallback.remove_prefix(&self.keys.namespace_prefix());
        tracing::info!(
            namespace = self.keys.namespace(),
            remote_removed,
            fallback_removed,
            "Cleared cache namespace"
        );
        remote_removed + fallback_removed
    }

    async fn remote_get(&self, key: &CacheKey) -> Option<String> {
        let store = self.connection.handle().await?;
        self.bounded("get", store.get(key.as_str())).await.flatten()
    }

    /// Run one remote operation under the operation timeout.
    ///
    /// Failures and timeouts are logged, counted and turned into `None`.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = RemoteResult<T>>,
    ) -> Option<T> {
        let err = match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(err)) => err,
            Err(_) => RemoteError::Timeout {
                operation,
                after: self.operation_timeout,
            },
        };
        TierCounters::bump(&self.counters.remote_errors);
        tracing::warn!(operation, error = %err, "Remote cache operation failed, using fallback");
        None
    }
}

impl TieredCache<NoRemote> {
    /// A cache that only ever uses the in-process fallback store.
    pub fn fallback_only(config: &CacheConfig) -> CacheResult<Self> {
        let config = CacheConfig {
            mode: CacheMode::FallbackOnly,
            ..config.clone()
        };
        Self::new(NoRemote, &config)
    }
}

fn normalize_ttl(ttl: Duration) -> Duration {
    Duration::from_secs(ttl.as_secs().max(1))
}

fn decode<T: DeserializeOwned>(raw: &str) -> CacheResult<T> {
    serde_json::from_str(raw).map_err(CacheError::serialization)
}

/// Connector for caches without a remote tier. Every call reports
/// [`RemoteError::Unavailable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemote;

#[async_trait]
impl RemoteConnector for NoRemote {
    type Store = NoRemote;

    async fn connect(&self) -> RemoteResult<NoRemote> {
        Err(RemoteError::Unavailable)
    }

    fn describe(&self) -> String {
        "none".to_string()
    }
}

#[async_trait]
impl RemoteStore for NoRemote {
    async fn ping(&self) -> RemoteResult<()> {
        Err(RemoteError::Unavailable)
    }

    async fn get(&self, _key: &str) -> RemoteResult<Option<String>> {
        Err(RemoteError::Unavailable)
    }

    async fn set_with_expiry(&self, _key: &str, _value: &str, _ttl: Duration) -> RemoteResult<()> {
        Err(RemoteError::Unavailable)
    }

    async fn scan(&self, _pattern: &str) -> RemoteResult<Vec<String>> {
        Err(RemoteError::Unavailable)
    }

    async fn delete(&self, _keys: &[String]) -> RemoteResult<u64> {
        Err(RemoteError::Unavailable)
    }

    async fn ttl(&self, _key: &str) -> RemoteResult<Option<Duration>> {
        Err(RemoteError::Unavailable)
    }

    async fn info(&self) -> RemoteResult<RemoteInfo> {
        Err(RemoteError::Unavailable)
    }
}
