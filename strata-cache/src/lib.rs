//! # strata-cache
//!
//! Layered caching for services that sit in front of a slower source of
//! truth.
//!
//! This crate provides:
//! - A bounded in-process memory tier with LRU eviction
//! - A remote tier behind reconnect, backoff and a circuit breaker
//! - A [`CacheManager`] that reads through the layers and backfills hits
//! - A tag index for invalidating everything derived from a record
//! - [`remember`](util::remember) with TTL jitter, negative caching and
//!   stale-while-revalidate
//! - Namespaced, schema-versioned keys
//! - A [`CacheService`] trait with in-process and HTTP proxy implementations
//!
//! ## Caching a computation
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use strata_cache::{CacheConfig, CacheError, CacheManager, EntityTag, RememberOptions};
//!
//! # async fn example() -> Result<(), CacheError> {
//! let cache = CacheManager::builder(CacheConfig::memory_only()).build()?;
//! cache.open().await;
//!
//! let name: String = cache
//!     .remember(
//!         "product:42",
//!         Duration::from_secs(300),
//!         || async { Ok::<_, CacheError>("Widget".to_string()) },
//!         RememberOptions::default().with_tag(EntityTag::record("product", 42)),
//!     )
//!     .await?;
//! assert_eq!(name, "Widget");
//!
//! // The product changed: drop everything derived from it.
//! cache.invalidate_record("product", 42).await;
//! cache.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Keys
//!
//! ```rust
//! use strata_cache::KeyNamespace;
//!
//! let keys = KeyNamespace::new("shop", "v2");
//! assert_eq!(keys.key("product", 42).as_str(), "shop:v2:product:42");
//! assert_eq!(keys.kind_pattern("product").as_str(), "shop:v2:product:*");
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use strata_cache::{CacheConfig, LayerKind};
//!
//! let config = CacheConfig::from_toml_str(r#"
//!     max_entries = 5000
//!     default_ttl_ms = 60000
//!     layers = ["memory"]
//! "#).unwrap();
//! assert_eq!(config.layers, vec![LayerKind::Memory]);
//! ```

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod layer;
pub mod logging;
pub mod manager;
pub mod memory;
pub mod options;
pub mod proxy;
pub mod remote;
pub mod service;
pub mod stats;
mod sweep;
pub mod tags;
pub mod util;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CacheConfig, CacheMode, ProxyConfig, RemoteConfig};
pub use entry::{CacheEntry, EntryMetadata, StoredEntry};
pub use error::{CacheError, CacheResult, NotFound};
pub use invalidation::{EntityTag, InvalidationEvent, MutationKind};
pub use key::{CacheKey, CacheKeyBuilder, KeyNamespace, KeyPattern, validate_key};
pub use layer::{CacheLayer, LayerKind};
pub use manager::{CacheManager, CacheManagerBuilder, Lookup};
pub use memory::MemoryTier;
pub use options::{CacheOptions, RememberOptions, presets};
pub use proxy::ProxyCache;
pub use remote::{
    BreakerConfig, BreakerState, CircuitBreaker, RemoteConnector, RemoteStore, RemoteTier,
    ResilienceSettings, ResilientClient,
};
pub use service::{CacheService, CacheServiceExt};
pub use stats::{CacheMetrics, CacheStats};
pub use tags::TagIndex;
pub use util::{jittered, remember, remember_swr, soft_ttl};

// Re-export logging utilities
pub use logging::{get_log_format, get_log_level, init as init_logging, init_with_level, is_debug_enabled};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::CacheConfig;
    pub use crate::error::{CacheError, CacheResult, NotFound};
    pub use crate::invalidation::{EntityTag, InvalidationEvent};
    pub use crate::key::{KeyNamespace, KeyPattern};
    pub use crate::manager::{CacheManager, Lookup};
    pub use crate::options::{CacheOptions, RememberOptions};
    pub use crate::service::{CacheService, CacheServiceExt};
    pub use crate::util::{remember, remember_swr};
}
