//! Remote store traits and the stats snapshot.
//!
//! This module defines the seam between the cache layer and the external
//! key-value service that backs its primary tier, plus the caller-provided
//! computation used for read-through.

use std::time::Duration;

use async_trait::async_trait;
use forecache_core::{CacheKey, CacheResult, RemoteResult};
use serde::Serialize;

use super::connection::ConnectionState;

/// Opens connections to a remote store.
///
/// The cache layer applies its own connect timeout around [`connect`] and
/// pings the returned store before using it, so implementations need not do
/// either.
///
/// [`connect`]: RemoteConnector::connect
#[async_trait]
pub trait RemoteConnector: Send + Sync + 'static {
    type Store: RemoteStore;

    async fn connect(&self) -> RemoteResult<Self::Store>;

    /// Human-readable endpoint for logs. Must not include credentials.
    fn describe(&self) -> String;
}

/// An open handle to a remote key-value store.
///
/// Values are opaque text (JSON produced by the cache layer). Every method
/// is wrapped in the configured operation timeout by the caller.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn ping(&self) -> RemoteResult<()>;

    async fn get(&self, key: &str) -> RemoteResult<Option<String>>;

    /// Store `value` under `key`, expiring after `ttl` (whole seconds, minimum one).
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> RemoteResult<()>;

    /// All keys matching a glob `pattern` (`*`, `?` and `\` escapes).
    async fn scan(&self, pattern: &str) -> RemoteResult<Vec<String>>;

    /// Delete `keys`, returning how many existed.
    async fn delete(&self, keys: &[String]) -> RemoteResult<u64>;

    /// Remaining lifetime of `key`. `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> RemoteResult<Option<Duration>>;

    async fn info(&self) -> RemoteResult<RemoteInfo>;
}

/// Server-side figures reported by the remote store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteInfo {
    /// Keys in the database the connection uses.
    pub key_count: u64,
    /// Memory use as reported by the server (e.g. `"1.02M"`).
    pub memory_used: Option<String>,
}

/// The tier a listed key was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Remote,
    Fallback,
}

/// One entry of a namespace-wide key listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyListing {
    pub key: String,
    pub tier: Tier,
    /// Whole seconds left before expiry, if known.
    pub ttl_secs: Option<u64>,
}

/// Computes an artifact on a full cache miss.
///
/// This is the expensive external computation the cache sits in front of.
#[async_trait]
pub trait ArtifactSource<T>: Send + Sync {
    async fn compute(&self, key: &CacheKey) -> CacheResult<T>;
}

/// Point-in-time view of the cache, recomputed on every request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// True when the remote store answered the stats probe.
    pub remote_connected: bool,
    pub connection_state: ConnectionState,
    /// Failed connection attempts so far.
    pub connection_attempts: u32,
    /// Entries held by the fallback store, including not-yet-reclaimed expired ones.
    pub fallback_size: usize,
    pub fallback_capacity: usize,
    pub remote_key_count: Option<u64>,
    pub remote_memory_used: Option<String>,
    pub remote_hits: u64,
    pub fallback_hits: u64,
    pub misses: u64,
    /// Remote operations that failed or timed out and fell through.
    pub remote_errors: u64,
}

impl StatsSnapshot {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.remote_hits + self.fallback_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
