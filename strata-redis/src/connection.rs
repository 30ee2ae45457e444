//! Redis implementations of the remote-store seams.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use strata_cache::{CacheResult, RemoteConnector, RemoteStore};
use tracing::debug;

use crate::config::RedisConfig;
use crate::error::{RedisError, RedisResult};

/// Keys fetched per `SCAN` round trip.
const SCAN_COUNT: usize = 100;

/// Opens multiplexed Redis connections.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    config: RedisConfig,
}

impl RedisConnector {
    /// Create a connector.
    pub fn new(config: RedisConfig) -> Self {
        Self { config }
    }

    /// The connection settings.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Open a connection and check it with `PING`.
    pub async fn open(&self) -> RedisResult<RedisStore> {
        let client = redis::Client::open(self.config.to_url()?)
            .map_err(|e| RedisError::config(format!("failed to create Redis client: {}", e)))?;
        let connection = tokio::time::timeout(
            self.config.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            RedisError::connection(format!(
                "connect to {} timed out after {}ms",
                self.config.endpoint(),
                self.config.connect_timeout.as_millis()
            ))
        })??;

        let store = RedisStore { connection };
        store.ping_inner().await?;
        debug!(endpoint = %self.config.endpoint(), "redis connection established");
        Ok(store)
    }
}

#[async_trait]
impl RemoteConnector for RedisConnector {
    async fn connect(&self) -> CacheResult<Arc<dyn RemoteStore>> {
        let store = self.open().await?;
        Ok(Arc::new(store))
    }

    fn endpoint(&self) -> String {
        self.config.endpoint()
    }
}

/// One multiplexed Redis connection.
///
/// Cloning the inner connection is cheap; every command runs on a clone so
/// callers never contend for `&mut` access.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    async fn ping_inner(&self) -> RedisResult<()> {
        let mut conn = self.conn();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply != "PONG" {
            return Err(RedisError::Reply(format!("PING returned {reply:?}")));
        }
        Ok(())
    }

    async fn scan_inner(&self, pattern: &str) -> RedisResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(RedisError::from)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: u64) -> CacheResult<()> {
        let mut conn = self.conn();
        let _: () = conn
            .pset_ex(key, value, ttl_ms.max(1))
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let removed: u64 = conn.del(keys).await.map_err(RedisError::from)?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(key).await.map_err(RedisError::from)?;
        Ok(exists)
    }

    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        Ok(self.scan_inner(pattern).await?)
    }

    async fn flush(&self) -> CacheResult<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(self.ping_inner().await?)
    }
}
