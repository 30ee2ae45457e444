//! Remote key/value tier.
//!
//! A driver crate implements [`RemoteConnector`] and [`RemoteStore`] for a
//! concrete store. [`ResilientClient`] wraps the connector with reconnect,
//! backoff and a circuit breaker, and [`RemoteTier`] adapts the client to the
//! [`CacheLayer`](crate::layer::CacheLayer) interface.

mod breaker;
mod resilient;
mod tier;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, FailureAction};
pub use resilient::{ResilienceSettings, ResilientClient};
pub use tier::RemoteTier;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::CacheResult;

/// One live connection to a remote store.
///
/// Implementations report failures as errors; degrading to no-ops is the job
/// of [`ResilientClient`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch raw bytes.
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store raw bytes with a native time-to-live in milliseconds.
    async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: u64) -> CacheResult<()>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> CacheResult<u64>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Keys matching a glob, collected with a cursor scan.
    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Remove every key in the selected database.
    async fn flush(&self) -> CacheResult<()>;

    /// Round-trip check.
    async fn ping(&self) -> CacheResult<()>;
}

/// Opens connections to a remote store.
#[async_trait]
pub trait RemoteConnector: Send + Sync + 'static {
    /// Open a new connection.
    async fn connect(&self) -> CacheResult<Arc<dyn RemoteStore>>;

    /// Endpoint description for logs, without credentials.
    fn endpoint(&self) -> String;
}
