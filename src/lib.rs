//! # Strata
//!
//! A multi-layer cache for services in front of a slow source of truth.
//!
//! Strata provides:
//! - A bounded in-process memory tier with LRU eviction
//! - A Redis tier that degrades to no-ops behind a circuit breaker
//! - Tag-based invalidation driven by mutation events
//! - `remember` with TTL jitter, negative caching and stale-while-revalidate
//! - An in-process manager or an HTTP proxy behind one service trait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use strata::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CacheError> {
//!     let cache = strata::open(CacheConfig::from_env()?).await?;
//!
//!     let greeting: String = cache
//!         .remember(
//!             "greeting:en",
//!             Duration::from_secs(60),
//!             || async { Ok::<_, CacheError>("hello".to_string()) },
//!             RememberOptions::default(),
//!         )
//!         .await?;
//!     println!("{greeting}");
//!
//!     cache.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Invalidation
//!
//! ```rust,ignore
//! // After committing an update to product 42 in category 7:
//! let event = InvalidationEvent::update("product")
//!     .with_record(42)
//!     .with_related("category", 7);
//! cache.invalidate_event(&event).await;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;
use tracing::info;

/// Cache engine: manager, tiers, keys, invalidation.
pub mod cache {
    pub use strata_cache::*;
}

/// Redis remote tier.
#[cfg(feature = "redis")]
pub mod redis {
    pub use strata_redis::*;
}

pub use strata_cache::{
    CacheConfig, CacheError, CacheManager, CacheMode, CacheOptions, CacheResult, CacheService,
    CacheServiceExt, CacheStats, EntityTag, InvalidationEvent, KeyNamespace, KeyPattern, Lookup,
    ProxyCache, RememberOptions,
};

/// Build and open an in-process [`CacheManager`] for `config`.
///
/// When the configured layers include the remote tier, a Redis connector is
/// wired from `config.remote`. An unreachable Redis does not fail this call:
/// the manager starts with the remote circuit open and serves from memory.
pub async fn open(config: CacheConfig) -> CacheResult<CacheManager> {
    if let CacheMode::Proxy(ref proxy) = config.mode {
        return Err(CacheError::config(format!(
            "proxy mode ({}) has no in-process manager; use strata::connect",
            proxy.url
        )));
    }

    let builder = with_remote(CacheManager::builder(config.clone()), &config);
    let manager = builder.build()?;
    manager.open().await;
    info!(layers = ?manager.layer_names(), "strata cache ready");
    Ok(manager)
}

/// Open the cache described by `config` behind the [`CacheService`] trait:
/// an HTTP client in proxy mode, an in-process manager otherwise.
pub async fn connect(config: CacheConfig) -> CacheResult<Arc<dyn CacheService>> {
    config.validate()?;
    match config.mode {
        CacheMode::Proxy(ref proxy) => {
            info!(url = %proxy.url, "using cache proxy");
            Ok(Arc::new(ProxyCache::new(proxy)?))
        }
        CacheMode::InProcess => Ok(Arc::new(open(config).await?)),
    }
}

#[cfg(feature = "redis")]
fn with_remote(
    builder: strata_cache::CacheManagerBuilder,
    config: &CacheConfig,
) -> strata_cache::CacheManagerBuilder {
    if !config.uses_remote() {
        return builder;
    }
    let connector = strata_redis::RedisConnector::new(strata_redis::RedisConfig::from_remote(
        &config.remote,
    ));
    builder.remote_connector(Arc::new(connector))
}

#[cfg(not(feature = "redis"))]
fn with_remote(
    builder: strata_cache::CacheManagerBuilder,
    config: &CacheConfig,
) -> strata_cache::CacheManagerBuilder {
    if config.uses_remote() {
        tracing::warn!("remote layer configured but the `redis` feature is disabled");
    }
    builder
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use strata_cache::prelude::*;
    pub use strata_cache::CacheStats;
}
