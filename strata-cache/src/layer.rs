//! The layer abstraction the manager scans.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::entry::StoredEntry;
use crate::error::{CacheError, CacheResult};
use crate::key::KeyPattern;

/// Which kind of store a layer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// In-process memory tier.
    Memory,
    /// Remote key/value tier.
    Remote,
}

impl LayerKind {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "remote" | "redis" => Ok(Self::Remote),
            other => Err(CacheError::config(format!("unknown cache layer {other:?}"))),
        }
    }
}

/// One tier of the cache.
///
/// Layers store [`StoredEntry`] values and never interpret tags; the manager
/// owns the tag index. A layer that cannot serve a request may either return
/// an error or degrade (`Ok(None)` / `Ok(false)`); the manager treats both as
/// a miss or a failed write for that layer only.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Layer kind.
    fn kind(&self) -> LayerKind;

    /// Name used in logs and stats.
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Fetch an entry. Expired entries may be returned; the caller checks.
    async fn get(&self, key: &str) -> CacheResult<Option<StoredEntry>>;

    /// Store an entry. Returns whether the layer accepted it.
    async fn set(&self, key: &str, entry: &StoredEntry) -> CacheResult<bool>;

    /// Remove a key. Returns whether it was present.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Whether a live entry exists.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Keys matching a validated pattern.
    async fn keys(&self, pattern: &KeyPattern) -> CacheResult<Vec<String>>;

    /// Remove everything.
    async fn clear(&self) -> CacheResult<()>;

    /// Number of entries, if the layer can tell cheaply.
    async fn len(&self) -> CacheResult<usize>;
}
