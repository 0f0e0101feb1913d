//! Forecache Storage - Tiered cache service and remote store backends
//!
//! Builds the cache service on top of the pure types in `forecache-core`.
//! The Redis backend is behind the default `redis` feature; [`mock`]
//! provides an in-process remote store for tests. The `cli` feature builds
//! the `cache-probe` admin binary.

pub mod cache;
pub mod mock;

pub use cache::{
    ArtifactSource, ConnectionManager, ConnectionSettings, ConnectionState, FallbackStore,
    KeyListing, NoRemote, RemoteConnector, RemoteInfo, RemoteStore, StatsSnapshot, Tier,
    TieredCache,
};
#[cfg(feature = "redis")]
pub use cache::{RedisConnector, RedisStore};
pub use mock::MockRemote;
