//! Cache lifetime tiers keyed on forecast horizon.
//!
//! Short-horizon forecasts go stale as soon as fresher observations arrive,
//! so they get the shortest lifetime. Long horizons move slowly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Step function from horizon (days) to cache lifetime.
///
/// | horizon days | default lifetime |
/// |---|---|
/// | `<= short_max_days` (7) | `short_secs` (1h) |
/// | `<= medium_max_days` (30) | `medium_secs` (6h) |
/// | longer | `long_secs` (24h) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlPolicy {
    pub short_max_days: i64,
    pub medium_max_days: i64,
    pub short_secs: u64,
    pub medium_secs: u64,
    pub long_secs: u64,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            short_max_days: 7,
            medium_max_days: 30,
            short_secs: 3_600,
            medium_secs: 21_600,
            long_secs: 86_400,
        }
    }
}

impl TtlPolicy {
    pub fn ttl_for(&self, horizon_days: i64) -> Duration {
        let secs = if horizon_days <= self.short_max_days {
            self.short_secs
        } else if horizon_days <= self.medium_max_days {
            self.medium_secs
        } else {
            self.long_secs
        };
        Duration::from_secs(secs)
    }

    /// Tier boundaries must be ordered and every lifetime non-zero.
    pub fn is_well_formed(&self) -> bool {
        self.short_max_days <= self.medium_max_days
            && self.short_secs > 0
            && self.medium_secs > 0
            && self.long_secs > 0
    }
}

/// Lifetime for a forecast horizon under the default tiers.
pub fn ttl_for_horizon(horizon_days: i64) -> Duration {
    TtlPolicy::default().ttl_for(horizon_days)
}
