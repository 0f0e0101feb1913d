//! Forecache Core - Keys, TTL tiers, configuration and errors
//!
//! Pure types and pure functions shared by the cache layer. Nothing in this
//! crate performs I/O.

use chrono::{DateTime, Utc};

pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod ttl;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use clock::{add_duration, Clock, ManualClock, SystemClock};
pub use config::{redact_url, CacheConfig, CacheMode, ReconnectPolicy};
pub use error::{
    CacheError, CacheResult, ConfigError, KeyError, RemoteError, RemoteResult,
};
pub use key::{
    derive_key, escape_glob, CacheKey, KeyDeriver, KeyParams, ParamValue, SubjectScope,
    DEFAULT_NAMESPACE, KEY_DELIMITER,
};
pub use ttl::{ttl_for_horizon, TtlPolicy};
