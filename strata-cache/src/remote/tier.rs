use async_trait::async_trait;
use tracing::{debug, warn};

use super::ResilientClient;
use crate::clock::SharedClock;
use crate::entry::StoredEntry;
use crate::error::CacheResult;
use crate::key::KeyPattern;
use crate::layer::{CacheLayer, LayerKind};

/// The remote tier as a cache layer.
///
/// Entries are stored as JSON with the store's native TTL set to the entry's
/// remaining lifetime, so keys this process never revisits still expire.
#[derive(Debug, Clone)]
pub struct RemoteTier {
    client: ResilientClient,
    key_prefix: String,
    clock: SharedClock,
}

impl RemoteTier {
    /// Wrap a client.
    pub fn new(client: ResilientClient, clock: SharedClock) -> Self {
        Self {
            client,
            key_prefix: String::new(),
            clock,
        }
    }

    /// Prefix every remote key, for sharing a database with other data.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// The underlying client.
    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn scan_local(&self, pattern: &str) -> Vec<String> {
        self.client
            .scan(pattern)
            .await
            .into_iter()
            .filter_map(|k| k.strip_prefix(self.key_prefix.as_str()).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl CacheLayer for RemoteTier {
    fn kind(&self) -> LayerKind {
        LayerKind::Remote
    }

    async fn get(&self, key: &str) -> CacheResult<Option<StoredEntry>> {
        let remote_key = self.remote_key(key);
        let Some(bytes) = self.client.get(&remote_key).await else {
            return Ok(None);
        };
        match StoredEntry::from_bytes(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(key = %key, error = %e, "discarding undecodable remote entry");
                self.client.delete(&[remote_key]).await;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, entry: &StoredEntry) -> CacheResult<bool> {
        let ttl_ms = entry.expires - self.clock.now_millis();
        if ttl_ms <= 0 {
            debug!(key = %key, "skipping remote write of expired entry");
            return Ok(false);
        }
        let bytes = entry.to_bytes()?;
        Ok(self
            .client
            .set(&self.remote_key(key), bytes, ttl_ms as u64)
            .await)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.client.delete(&[self.remote_key(key)]).await > 0)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.client.exists(&self.remote_key(key)).await)
    }

    async fn keys(&self, pattern: &KeyPattern) -> CacheResult<Vec<String>> {
        Ok(self.scan_local(&pattern.with_prefix(&self.key_prefix)).await)
    }

    async fn clear(&self) -> CacheResult<()> {
        if self.key_prefix.is_empty() {
            self.client.flush().await;
        } else {
            let keys: Vec<String> = self
                .client
                .scan(&format!("{}*", self.key_prefix))
                .await;
            self.client.delete(&keys).await;
        }
        Ok(())
    }

    async fn len(&self) -> CacheResult<usize> {
        Ok(self.scan_local(&format!("{}*", self.key_prefix)).await.len())
    }
}
