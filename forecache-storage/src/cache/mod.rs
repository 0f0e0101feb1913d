//! Two-tier artifact cache.
//!
//! A remote key-value store is the primary tier and a bounded in-process
//! map is the fallback. The remote tier is optional at every step: a store
//! that cannot be reached, a command that fails, or a command that outlives
//! the operation timeout all degrade to the fallback tier instead of
//! failing the caller.
//!
//! # Tiers
//!
//! - [`ConnectionManager`] opens the remote handle lazily, spends a bounded
//!   connect budget, and then gives up (or cools down and re-probes,
//!   depending on [`ReconnectPolicy`](forecache_core::ReconnectPolicy)).
//! - [`FallbackStore`] holds serialized values with an expiry, reclaiming
//!   expired entries lazily on read and in one sweep when over capacity.
//! - [`TieredCache`] composes both behind `get`, `set`, `invalidate` and
//!   `stats`, plus `refresh` and the namespace-wide `keys`, `delete` and
//!   `clear` used for administration.
//!
//! # Example
//!
//! ```ignore
//! let config = CacheConfig::from_env()?;
//! let cache = TieredCache::new(RedisConnector::from_config(&config)?, &config)?;
//!
//! let key = cache.derive_key("42", &KeyParams::new().with("days", 30))?;
//! let forecast: Forecast = cache.get_or_compute(&key, cache.ttl_for(30), &model).await?;
//! cache.invalidate("42").await?;
//! ```

pub mod connection;
pub mod fallback;
#[cfg(feature = "redis")]
pub mod redis_backend;
pub mod tiered;
pub mod traits;

pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState};
pub use fallback::FallbackStore;
#[cfg(feature = "redis")]
pub use redis_backend::{parse_info, RedisConnector, RedisStore};
pub use tiered::{NoRemote, TieredCache};
pub use traits::{
    ArtifactSource, KeyListing, RemoteConnector, RemoteInfo, RemoteStore, StatsSnapshot, Tier,
};
