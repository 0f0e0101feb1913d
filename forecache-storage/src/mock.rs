//! In-process remote store for tests and local runs.
//!
//! [`MockRemote`] behaves like a single remote database: values expire
//! through the injected [`Clock`], keys are matched with the same glob
//! dialect the remote scan uses, and switches let a test make the store
//! unreachable, fail every command, or hang until the caller's timeout
//! fires. Clones share state, so a test can keep one handle to flip switches
//! while the cache owns another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use forecache_core::{add_duration, Clock, RemoteError, RemoteResult, SystemClock, Timestamp};

use crate::cache::{RemoteConnector, RemoteInfo, RemoteStore};

#[derive(Debug)]
struct MockInner {
    entries: Mutex<HashMap<String, (String, Timestamp)>>,
    clock: Arc<dyn Clock>,
    reachable: AtomicBool,
    failing: AtomicBool,
    stalled: AtomicBool,
    connect_calls: AtomicU32,
    operation_calls: AtomicU64,
}

/// Shared-state fake remote store. Acts as its own connector.
#[derive(Debug, Clone)]
pub struct MockRemote {
    inner: Arc<MockInner>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    /// A reachable, healthy store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(MockInner {
                entries: Mutex::new(HashMap::new()),
                clock,
                reachable: AtomicBool::new(true),
                failing: AtomicBool::new(false),
                stalled: AtomicBool::new(false),
                connect_calls: AtomicU32::new(0),
                operation_calls: AtomicU64::new(0),
            }),
        }
    }

    /// When false, connects are refused and commands fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// When true, connects succeed but every command fails.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// When true, connects and commands never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Connection attempts received, successful or not.
    pub fn connect_calls(&self) -> u32 {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    /// Commands received on open handles, including pings.
    pub fn operation_calls(&self) -> u64 {
        self.inner.operation_calls.load(Ordering::SeqCst)
    }

    /// Whether a live (unexpired) value is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.live_value(key).is_some()
    }

    /// Raw stored text for `key`, bypassing the switches.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.live_value(key)
    }

    /// Store a value directly, bypassing the switches.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        let expires_at = add_duration(self.inner.clock.now(), ttl);
        self.entries().insert(key.into(), (value.into(), expires_at));
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.inner.clock.now();
        self.entries().values().filter(|(_, exp)| now < *exp).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = self.inner.clock.now();
        self.entries()
            .get(key)
            .filter(|(_, expires_at)| now < *expires_at)
            .map(|(value, _)| value.clone())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, (String, Timestamp)>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply the switches to one command.
    async fn command(&self, operation: &'static str) -> RemoteResult<()> {
        self.inner.operation_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::operation(operation, "connection reset by peer"));
        }
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::operation(operation, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteConnector for MockRemote {
    type Store = MockRemote;

    async fn connect(&self) -> RemoteResult<MockRemote> {
        self.inner.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::connect("connection refused"));
        }
        Ok(self.clone())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn ping(&self) -> RemoteResult<()> {
        self.command("ping").await
    }

    async fn get(&self, key: &str) -> RemoteResult<Option<String>> {
        self.command("get").await?;
        Ok(self.live_value(key))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> RemoteResult<()> {
        self.command("set").await?;
        // Expiry has whole-second resolution with a one second floor.
        let ttl = Duration::from_secs(ttl.as_secs().max(1));
        self.insert_raw(key, value, ttl);
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> RemoteResult<Vec<String>> {
        self.command("scan").await?;
        let now = self.inner.clock.now();
        Ok(self
            .entries()
            .iter()
            .filter(|(key, (_, expires_at))| now < *expires_at && glob_matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> RemoteResult<u64> {
        self.command("delete").await?;
        let now = self.inner.clock.now();
        let mut entries = self.entries();
        let removed = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .filter(|(_, expires_at)| now < *expires_at)
            .count();
        Ok(removed as u64)
    }

    async fn ttl(&self, key: &str) -> RemoteResult<Option<Duration>> {
        self.command("ttl").await?;
        let now = self.inner.clock.now();
        Ok(self
            .entries()
            .get(key)
            .filter(|(_, expires_at)| now < *expires_at)
            .and_then(|(_, expires_at)| (*expires_at - now).to_std().ok()))
    }

    async fn info(&self) -> RemoteResult<RemoteInfo> {
        self.command("info").await?;
        let now = self.inner.clock.now();
        let entries = self.entries();
        let live = entries.iter().filter(|(_, (_, exp))| now < *exp);
        let (count, bytes) = live.fold((0u64, 0usize), |(n, b), (key, (value, _))| {
            (n + 1, b + key.len() + value.len())
        });
        Ok(RemoteInfo {
            key_count: count,
            memory_used: Some(format!("{}B", bytes)),
        })
    }
}

/// Glob match supporting `*`, `?` and backslash escapes.
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_from(&pattern, &text)
}

fn glob_from(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|skip| glob_from(rest, &text[skip..])),
        Some(('?', rest)) => !text.is_empty() && glob_from(rest, &text[1..]),
        Some(('\\', rest)) => match rest.split_first() {
            Some((literal, rest)) => {
                text.first() == Some(literal) && glob_from(rest, &text[1..])
            }
            None => text.len() == 1 && text[0] == '\\',
        },
        Some((literal, rest)) => text.first() == Some(literal) && glob_from(rest, &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forecache_core::{escape_glob, ManualClock};

    #[test]
    fn test_glob_wildcards() {
        assert!(glob_matches("forecast:42:*", "forecast:42:abc"));
        assert!(glob_matches("forecast:42:*", "forecast:42:"));
        assert!(!glob_matches("forecast:42:*", "forecast:420:abc"));
        assert!(!glob_matches("forecast:42:*", "forecast:42"));
        assert!(glob_matches("f?o", "foo"));
        assert!(!glob_matches("f?o", "fo"));
        assert!(glob_matches("*", ""));
    }

    #[test]
    fn test_glob_escapes_are_literal() {
        assert!(glob_matches(r"a\*b", "a*b"));
        assert!(!glob_matches(r"a\*b", "axb"));
        let pattern = format!("{}*", escape_glob("ns:we?rd*:"));
        assert!(glob_matches(&pattern, "ns:we?rd*:x"));
        assert!(!glob_matches(&pattern, "ns:weird-:x"));
    }

    #[tokio::test]
    async fn test_values_expire_with_clock() {
        let clock = Arc::new(ManualClock::starting_now());
        let remote = MockRemote::with_clock(clock.clone());

        remote
            .set_with_expiry("k", "v", Duration::from_millis(10))
            .await
            .expect("set");
        // Sub-second ttls round up to one second.
        clock.advance(Duration::from_millis(900));
        assert_eq!(remote.get("k").await.expect("get").as_deref(), Some("v"));
        clock.advance(Duration::from_millis(100));
        assert_eq!(remote.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_switches() {
        let remote = MockRemote::new();
        remote.set_failing(true);
        assert!(remote.connect().await.is_ok());
        assert!(remote.ping().await.is_err());

        remote.set_failing(false);
        remote.set_reachable(false);
        assert!(matches!(
            remote.connect().await,
            Err(RemoteError::Connect { .. })
        ));
        assert_eq!(remote.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_scan_delete_and_info() {
        let remote = MockRemote::new();
        let ttl = Duration::from_secs(60);
        remote.insert_raw("forecast:42", "a", ttl);
        remote.insert_raw("forecast:42:x", "b", ttl);
        remote.insert_raw("forecast:420:x", "c", ttl);

        let mut found = remote.scan("forecast:42:*").await.expect("scan");
        found.sort();
        assert_eq!(found, vec!["forecast:42:x".to_string()]);

        let removed = remote
            .delete(&["forecast:42".to_string(), "missing".to_string()])
            .await
            .expect("delete");
        assert_eq!(removed, 1);

        let info = remote.info().await.expect("info");
        assert_eq!(info.key_count, 2);
        assert!(info.memory_used.is_some());
    }

    #[tokio::test]
    async fn test_ttl_reports_remaining_lifetime() {
        let clock = Arc::new(ManualClock::starting_now());
        let remote = MockRemote::with_clock(clock.clone());
        remote.insert_raw("forecast:1", "v", Duration::from_secs(60));

        clock.advance(Duration::from_secs(15));
        assert_eq!(
            remote.ttl("forecast:1").await.expect("ttl"),
            Some(Duration::from_secs(45))
        );
        assert_eq!(remote.ttl("missing").await.expect("ttl"), None);

        clock.advance(Duration::from_secs(45));
        assert_eq!(remote.ttl("forecast:1").await.expect("ttl"), None);
    }
}
