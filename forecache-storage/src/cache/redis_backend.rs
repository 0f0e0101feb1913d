//! Redis-backed remote store.
//!
//! Uses redis' managed multiplexed connection, so one handle serves every
//! concurrent caller and each command clones it cheaply. When the socket
//! drops, the command in flight fails (and falls through to the fallback
//! tier) while the handle re-establishes the connection in the background;
//! later commands use the new socket without another connect.
//!
//! # Key scans
//!
//! Invalidation uses cursor-based `SCAN ... MATCH`, never `KEYS`, so a large
//! keyspace is walked in batches without blocking the server.

use std::time::Duration;

use async_trait::async_trait;
use forecache_core::{redact_url, CacheConfig, CacheResult, ConfigError, RemoteError, RemoteResult};
use redis::aio::ConnectionManager as ManagedConnection;
use redis::AsyncCommands;

use super::traits::{RemoteConnector, RemoteInfo, RemoteStore};

/// Keys requested per `SCAN` round trip.
const SCAN_BATCH: usize = 256;

/// Opens managed connections to one Redis database.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: redis::Client,
    db: i64,
    endpoint: String,
}

impl RedisConnector {
    /// Build a connector from the configured URL.
    ///
    /// The URL is parsed here; nothing is contacted until the first connect.
    pub fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        let client = redis::Client::open(config.remote_url.as_str()).map_err(|e| {
            ConfigError::InvalidValue {
                field: "remote_url".to_string(),
                value: redact_url(&config.remote_url),
                reason: e.to_string(),
            }
        })?;

        let info = client.get_connection_info();
        let db = info.redis.db;
        let endpoint = format!("{}/{}", info.addr, db);

        Ok(Self {
            client,
            db,
            endpoint,
        })
    }

    /// Logical database number selected by the URL.
    pub fn db(&self) -> i64 {
        self.db
    }
}

#[async_trait]
impl RemoteConnector for RedisConnector {
    type Store = RedisStore;

    async fn connect(&self) -> RemoteResult<RedisStore> {
        let conn = ManagedConnection::new(self.client.clone())
            .await
            .map_err(RemoteError::connect)?;
        Ok(RedisStore { conn, db: self.db })
    }

    fn describe(&self) -> String {
        format!("redis://{}", self.endpoint)
    }
}

/// An open Redis handle.
#[derive(Clone)]
pub struct RedisStore {
    conn: ManagedConnection,
    db: i64,
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn ping(&self) -> RemoteResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RemoteError::operation("ping", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> RemoteResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| RemoteError::operation("get", e))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> RemoteResult<()> {
        let mut conn = self.conn.clone();
        // SETEX rejects a zero lifetime.
        let seconds = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(key, value, seconds)
            .await
            .map_err(|e| RemoteError::operation("set", e))?;
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> RemoteResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| RemoteError::operation("scan", e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> RemoteResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        conn.del(keys)
            .await
            .map_err(|e| RemoteError::operation("delete", e))
    }

    async fn ttl(&self, key: &str) -> RemoteResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let seconds: i64 = conn
            .ttl(key)
            .await
            .map_err(|e| RemoteError::operation("ttl", e))?;
        Ok(ttl_from_reply(seconds))
    }

    async fn info(&self) -> RemoteResult<RemoteInfo> {
        let mut conn = self.conn.clone();
        let raw: String = redis::cmd("INFO")
            .query_async(&mut conn)
            .await
            .map_err(|e| RemoteError::operation("info", e))?;
        Ok(parse_info(&raw, self.db))
    }
}

/// `TTL` answers -2 for a missing key and -1 for one without expiry.
fn ttl_from_reply(seconds: i64) -> Option<Duration> {
    u64::try_from(seconds).ok().map(Duration::from_secs)
}

/// Pull the key count of database `db` and `used_memory_human` out of an
/// `INFO` reply. A database with no keys has no keyspace line.
pub fn parse_info(raw: &str, db: i64) -> RemoteInfo {
    let keyspace = format!("db{}", db);
    let mut info = RemoteInfo::default();

    for line in raw.lines().map(str::trim) {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        if field == "used_memory_human" {
            info.memory_used = Some(value.to_string());
        } else if field == keyspace {
            info.key_count = value
                .split(',')
                .filter_map(|pair| pair.split_once('='))
                .find(|(name, _)| *name == "keys")
                .and_then(|(_, count)| count.parse().ok())
                .unwrap_or(0);
        }
    }

    info
}
