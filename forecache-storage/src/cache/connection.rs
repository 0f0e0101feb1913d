//! Lifecycle of the shared remote store connection.
//!
//! The connection is opened lazily on first use and then reused by every
//! caller. A failed connect counts against a fixed budget; once the budget
//! is spent the manager either abandons the remote tier for the rest of the
//! process ([`ReconnectPolicy::Never`]) or waits out a doubling cooldown
//! before probing again ([`ReconnectPolicy::Backoff`]).
//!
//! Only one attempt is ever in flight. The slot lock is released while it
//! runs, and callers arriving meanwhile get no handle and serve from the
//! fallback tier, so nobody waits longer than one connect timeout.
//!
//! An established connection is assumed live. Failures of individual
//! operations on it are handled by the caller and never change the state
//! held here.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use forecache_core::{add_duration, Clock, ReconnectPolicy, RemoteError, RemoteResult, Timestamp};
use serde::Serialize;

use super::traits::{RemoteConnector, RemoteStore};

/// Where the manager is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No usable handle yet; the next caller will try to connect.
    Disconnected,
    /// One caller is connecting; everyone else uses the fallback tier.
    Connecting,
    /// A handle is open and shared.
    Connected,
    /// Connect budget spent under backoff; no attempt before `retry_at`.
    CoolingDown { retry_at: Timestamp },
    /// Connect budget spent; the remote tier is abandoned for the process lifetime.
    PermanentlyDegraded,
    /// Remote tier switched off by configuration.
    Disabled,
}

/// Connection parameters taken from [`forecache_core::CacheConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub max_attempts: u32,
    pub reconnect: ReconnectPolicy,
    pub enabled: bool,
}

struct ConnectionSlot<S> {
    state: ConnectionState,
    store: Option<Arc<S>>,
    failed_attempts: u32,
    /// Failed probes since the budget was spent (backoff only).
    cooldowns: u32,
}

/// Puts the slot back in its prior state if the connecting caller is
/// cancelled mid-attempt. A cancelled attempt does not count as a failure.
struct AttemptGuard<'a, S> {
    slot: &'a Mutex<ConnectionSlot<S>>,
    previous: ConnectionState,
    armed: bool,
}

impl<S> Drop for AttemptGuard<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.state == ConnectionState::Connecting {
            slot.state = self.previous;
        }
    }
}

/// Owns the lazily created remote handle.
pub struct ConnectionManager<C: RemoteConnector> {
    connector: C,
    settings: ConnectionSettings,
    clock: Arc<dyn Clock>,
    slot: Mutex<ConnectionSlot<C::Store>>,
}

impl<C: RemoteConnector> ConnectionManager<C> {
    pub fn new(connector: C, settings: ConnectionSettings, clock: Arc<dyn Clock>) -> Self {
        let state = if settings.enabled {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Disabled
        };
        Self {
            connector,
            settings,
            clock,
            slot: Mutex::new(ConnectionSlot {
                state,
                store: None,
                failed_attempts: 0,
                cooldowns: 0,
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Failed connection attempts so far.
    pub fn failed_attempts(&self) -> u32 {
        self.lock().failed_attempts
    }

    /// True iff a usable remote handle exists after the call.
    pub async fn ensure_connected(&self) -> bool {
        self.handle().await.is_some()
    }

    /// The shared remote handle, connecting first if the state allows it.
    ///
    /// Returns `None` without waiting when another caller's attempt is in
    /// flight.
    pub async fn handle(&self) -> Option<Arc<C::Store>> {
        let (previous, probing) = {
            let mut slot = self.lock();
            let previous = slot.state;
            let probing = match previous {
                ConnectionState::Connected => return slot.store.clone(),
                ConnectionState::Disabled
                | ConnectionState::PermanentlyDegraded
                | ConnectionState::Connecting => return None,
                ConnectionState::CoolingDown { retry_at } if self.clock.now() < retry_at => {
                    return None
                }
                ConnectionState::CoolingDown { .. } => true,
                ConnectionState::Disconnected => false,
            };
            slot.state = ConnectionState::Connecting;
            (previous, probing)
        };

        let mut guard = AttemptGuard {
            slot: &self.slot,
            previous,
            armed: true,
        };
        let result = self.connect().await;
        guard.armed = false;

        let mut slot = self.lock();
        match result {
            Ok(store) => {
                let store = Arc::new(store);
                slot.store = Some(Arc::clone(&store));
                slot.state = ConnectionState::Connected;
                slot.cooldowns = 0;
                tracing::info!(
                    endpoint = %self.connector.describe(),
                    failed_attempts = slot.failed_attempts,
                    "Remote cache store connected"
                );
                Some(store)
            }
            Err(err) => {
                slot.failed_attempts = slot.failed_attempts.saturating_add(1);
                tracing::warn!(
                    endpoint = %self.connector.describe(),
                    attempt = slot.failed_attempts,
                    error = %err,
                    "Remote cache store connection failed"
                );
                let next = self.state_after_failure(&mut slot, probing);
                slot.state = next;
                None
            }
        }
    }

    fn state_after_failure(
        &self,
        slot: &mut ConnectionSlot<C::Store>,
        probing: bool,
    ) -> ConnectionState {
        if !probing && slot.failed_attempts < self.settings.max_attempts {
            return ConnectionState::Disconnected;
        }

        slot.cooldowns = slot.cooldowns.saturating_add(1);
        match self.settings.reconnect.cooldown(slot.cooldowns) {
            Some(delay) => {
                let retry_at = add_duration(self.clock.now(), delay);
                tracing::warn!(
                    cooldown_ms = delay.as_millis() as u64,
                    %retry_at,
                    "Remote cache store unavailable, serving from fallback until next probe"
                );
                ConnectionState::CoolingDown { retry_at }
            }
            None => {
                tracing::warn!(
                    failed_attempts = slot.failed_attempts,
                    "Remote cache store abandoned, falling back to in-process cache for the rest of the process"
                );
                ConnectionState::PermanentlyDegraded
            }
        }
    }

    /// Connect and ping within the connect timeout.
    async fn connect(&self) -> RemoteResult<C::Store> {
        let timeout = self.settings.connect_timeout;
        let attempt = async {
            let store = self.connector.connect().await?;
            store.ping().await?;
            Ok(store)
        };
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| RemoteError::Timeout {
                operation: "connect",
                after: timeout,
            })?
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionSlot<C::Store>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
