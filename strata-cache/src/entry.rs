//! Cache entries and their persisted shape.
//!
//! An entry carries an absolute expiry in epoch milliseconds. Every tier
//! treats `expires <= now` as absent, whether or not the entry has been
//! physically removed yet.
//!
//! On the remote tier an entry is stored as JSON:
//!
//! ```json
//! { "data": { "id": 42 }, "expires": 1700000060000, "tags": ["product:42"], "created": 1700000000000 }
//! ```
//!
//! Negative-cache markers add `"__negative": true` and carry `null` data.
//! `created` is optional on read; entries without it fall back to the TTL
//! the reader expects when working out their age.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::clock::duration_millis;
use crate::error::CacheResult;

/// Entry type stored by every layer.
pub type StoredEntry = CacheEntry<serde_json::Value>;

/// Access bookkeeping kept alongside an entry.
///
/// Only the creation time is persisted; access counters start fresh when an
/// entry is read back from the remote tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// When the entry was written (epoch ms).
    #[serde(default, skip_serializing_if = "is_unset")]
    pub created: i64,
    /// Last successful read (epoch ms).
    #[serde(skip)]
    pub last_accessed: i64,
    /// Number of successful reads.
    #[serde(skip)]
    pub hit_count: u64,
}

fn is_unset(created: &i64) -> bool {
    *created <= 0
}

/// A cached value with expiry and tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The cached value.
    pub data: T,
    /// Absolute expiry (epoch ms).
    pub expires: i64,
    /// Tags associated with this entry.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Set on negative-cache markers.
    #[serde(
        rename = "__negative",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub negative: bool,
    /// Access metadata.
    #[serde(flatten)]
    pub metadata: EntryMetadata,
}

impl<T> CacheEntry<T> {
    /// Create an entry written at `now` that lives for `ttl`.
    pub fn new(data: T, now: i64, ttl: Duration) -> Self {
        Self {
            data,
            expires: now.saturating_add(duration_millis(ttl)),
            tags: BTreeSet::new(),
            negative: false,
            metadata: EntryMetadata {
                created: now,
                last_accessed: now,
                hit_count: 0,
            },
        }
    }

    /// Attach tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the entry is logically absent at `now`.
    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires <= now
    }

    /// Remaining lifetime at `now`, zero once expired.
    pub fn remaining(&self, now: i64) -> Duration {
        Duration::from_millis(u64::try_from(self.expires - now).unwrap_or(0))
    }

    /// The lifetime the entry was written with, or `ttl` when its creation
    /// time is unknown. Reflects any jitter applied at write time.
    pub fn lifetime(&self, ttl: Duration) -> Duration {
        if self.metadata.created > 0 {
            Duration::from_millis(u64::try_from(self.expires - self.metadata.created).unwrap_or(0))
        } else {
            ttl
        }
    }

    /// Age of the entry at `now`.
    ///
    /// Entries that came back from the remote tier have no creation time, so
    /// their age is derived from `ttl` and the remaining lifetime.
    pub fn age(&self, now: i64, ttl: Duration) -> Duration {
        if self.metadata.created > 0 {
            Duration::from_millis(u64::try_from(now - self.metadata.created).unwrap_or(0))
        } else {
            ttl.saturating_sub(self.remaining(now))
        }
    }

    /// Record a successful read.
    pub fn touch(&mut self, now: i64) {
        self.metadata.last_accessed = now;
        self.metadata.hit_count += 1;
    }
}

impl StoredEntry {
    /// Encode a typed value into a storable entry.
    pub fn encode<T: Serialize + ?Sized>(value: &T, now: i64, ttl: Duration) -> CacheResult<Self> {
        Ok(Self::new(serde_json::to_value(value)?, now, ttl))
    }

    /// Build a negative-cache marker.
    pub fn negative_marker(now: i64, ttl: Duration) -> Self {
        let mut entry = Self::new(serde_json::Value::Null, now, ttl);
        entry.negative = true;
        entry
    }

    /// Decode the payload into a typed entry.
    pub fn decode<T: DeserializeOwned>(self) -> CacheResult<CacheEntry<T>> {
        Ok(CacheEntry {
            data: serde_json::from_value(self.data)?,
            expires: self.expires,
            tags: self.tags,
            negative: self.negative,
            metadata: self.metadata,
        })
    }

    /// Serialize to the remote wire format.
    pub fn to_bytes(&self) -> CacheResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the remote wire format.
    pub fn from_bytes(bytes: &[u8]) -> CacheResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Approximate in-memory footprint of this entry under `key`.
    pub fn estimated_size(&self, key: &str) -> usize {
        const OVERHEAD: usize = 64;
        let payload = serde_json::to_vec(&self.data).map(|v| v.len()).unwrap_or(0);
        let tags: usize = self.tags.iter().map(String::len).sum();
        key.len() + payload + tags + OVERHEAD
    }
}
