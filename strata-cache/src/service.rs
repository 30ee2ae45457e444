//! The cache as a service boundary.
//!
//! Application code that only needs get/set/invalidate can depend on
//! [`CacheService`] and stay agnostic of where the cache lives: in this
//! process ([`CacheManager`]) or behind HTTP ([`ProxyCache`](crate::ProxyCache)).

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::manager::CacheManager;
use crate::options::CacheOptions;
use crate::stats::CacheStats;

/// Untyped cache operations shared by every deployment mode.
///
/// Like the manager, implementations never fail: an unreachable backend
/// reads as empty and drops writes.
#[async_trait]
pub trait CacheService: Send + Sync {
    /// Fetch a JSON value.
    async fn get_value(&self, key: &str) -> Option<Value>;

    /// Store a JSON value. Returns whether it was stored.
    async fn set_value(&self, key: &str, value: Value, options: &CacheOptions) -> bool;

    /// Remove a key. Returns whether it was present.
    async fn delete(&self, key: &str) -> bool;

    /// Remove every key carrying any of the tags. Returns how many went.
    async fn invalidate_by_tags(&self, tags: &[String]) -> usize;

    /// Remove everything.
    async fn clear(&self);

    /// Statistics snapshot.
    async fn stats(&self) -> CacheStats;
}

/// Typed helpers for any [`CacheService`].
#[async_trait]
pub trait CacheServiceExt: CacheService {
    /// Fetch and decode a value. A value of the wrong shape reads as `None`.
    async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key).await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "cached value has an unexpected shape");
                None
            }
        }
    }

    /// Encode and store a value.
    async fn set_as<T: Serialize + Sync>(&self, key: &str, value: &T, options: &CacheOptions) -> bool {
        match serde_json::to_value(value) {
            Ok(v) => self.set_value(key, v, options).await,
            Err(e) => {
                warn!(key, error = %e, "failed to encode cache value");
                false
            }
        }
    }
}

impl<S: CacheService + ?Sized> CacheServiceExt for S {}

#[async_trait]
impl CacheService for CacheManager {
    async fn get_value(&self, key: &str) -> Option<Value> {
        self.get::<Value>(key).await
    }

    async fn set_value(&self, key: &str, value: Value, options: &CacheOptions) -> bool {
        self.set(key, &value, options).await
    }

    async fn delete(&self, key: &str) -> bool {
        CacheManager::delete(self, key).await
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        CacheManager::invalidate_by_tags(self, tags).await
    }

    async fn clear(&self) {
        CacheManager::clear(self).await
    }

    async fn stats(&self) -> CacheStats {
        CacheManager::stats(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use serde_json::json;
    use std::sync::Arc;

    fn service() -> Arc<dyn CacheService> {
        let manager = CacheManager::builder(CacheConfig::memory_only())
            .clock(ManualClock::shared(1_000))
            .build()
            .unwrap();
        Arc::new(manager)
    }

    #[tokio::test]
    async fn test_manager_behind_trait_object() {
        let cache = service();
        let opts = CacheOptions::default().with_tag("product:1");

        assert!(cache.set_value("p:1", json!({"id": 1}), &opts).await);
        assert_eq!(cache.get_value("p:1").await, Some(json!({"id": 1})));
        assert_eq!(cache.invalidate_by_tags(&["product:1".to_string()]).await, 1);
        assert_eq!(cache.get_value("p:1").await, None);
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        let cache = service();
        assert!(cache.set_as("n", &42u32, &CacheOptions::default()).await);
        assert_eq!(cache.get_as::<u32>("n").await, Some(42));
        assert_eq!(cache.get_as::<String>("n").await, None);
        assert!(cache.delete("n").await);
        cache.clear().await;
    }
}
