//! # strata-redis
//!
//! Redis remote tier for the Strata cache.
//!
//! This crate provides:
//! - [`RedisConnector`], which opens multiplexed connections for the cache's
//!   resilient remote client
//! - [`RedisStore`], the `GET` / `PSETEX` / `DEL` / `SCAN` command mapping
//! - [`RedisConfig`], parsed from a URL or from the cache's remote settings
//!
//! Entries are written with `PSETEX`, so keys expire in Redis on their own
//! even if no process reads them again.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strata_cache::{CacheConfig, CacheManager};
//! use strata_redis::{RedisConfig, RedisConnector};
//!
//! let config = CacheConfig::default();
//! let connector = RedisConnector::new(RedisConfig::from_remote(&config.remote));
//!
//! let cache = CacheManager::builder(config)
//!     .remote_connector(Arc::new(connector))
//!     .build()?;
//! cache.open().await;
//! ```

pub mod config;
pub mod connection;
pub mod error;

pub use config::RedisConfig;
pub use connection::{RedisConnector, RedisStore};
pub use error::{RedisError, RedisResult};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::RedisConfig;
    pub use crate::connection::{RedisConnector, RedisStore};
    pub use crate::error::{RedisError, RedisResult};
}
