//! Bounded in-process memory tier with LRU eviction.
//!
//! Entries, recency order and the [`TagIndex`] share a single mutex, so an
//! eviction or expiry and the matching index update happen in one critical
//! section. The lock is never held across an `.await`.
//!
//! Recency is tracked with a monotonically increasing access tick rather than
//! the wall clock, so entries touched within the same millisecond still have a
//! well-defined order.
//!
//! The tag index covers every layer, not just this one. When lower layers
//! exist, an evicted key keeps its tags (a *detached* association, with the
//! entry's expiry) until it is deleted, invalidated or expires, so tag
//! invalidation still reaches the copies below. Every invalidation bumps a
//! generation counter; backfills taken before the bump are dropped.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, trace};

use crate::clock::SharedClock;
use crate::entry::StoredEntry;
use crate::error::CacheResult;
use crate::key::KeyPattern;
use crate::layer::{CacheLayer, LayerKind};
use crate::tags::TagIndex;

/// Default capacity of the memory tier.
pub const DEFAULT_MAX_ENTRIES: usize = 1_000;

struct Slot {
    entry: StoredEntry,
    tick: u64,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, Slot>,
    recency: BTreeMap<u64, String>,
    index: TagIndex,
    /// Indexed keys with no entry here, and when they expire.
    detached: HashMap<String, i64>,
    tick: u64,
    generation: u64,
}

impl MemoryState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn bump(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(slot) = self.entries.get_mut(key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<StoredEntry> {
        self.detached.remove(key);
        self.index.remove_key(key);
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        Some(slot.entry)
    }

    fn evict_lru(&mut self, keep_tags: bool) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        let slot = self.entries.remove(&key)?;
        if keep_tags {
            self.detached.insert(key.clone(), slot.entry.expires);
        } else {
            self.index.remove_key(&key);
        }
        Some(key)
    }

    fn store(
        &mut self,
        key: &str,
        entry: StoredEntry,
        max_entries: usize,
        keep_tags: bool,
    ) -> Option<String> {
        let mut evicted = None;
        self.detached.remove(key);

        if let Some(slot) = self.entries.get_mut(key) {
            slot.entry = entry;
            self.bump(key);
        } else {
            if self.entries.len() >= max_entries {
                evicted = self.evict_lru(keep_tags);
                if let Some(ref victim) = evicted {
                    debug!(key = %victim, tags_kept = keep_tags, "evicted least recently used entry");
                }
            }
            let tick = self.next_tick();
            self.recency.insert(tick, key.to_string());
            self.entries.insert(key.to_string(), Slot { entry, tick });
        }

        let tags: Vec<String> = self
            .entries
            .get(key)
            .map(|slot| slot.entry.tags.iter().cloned().collect())
            .unwrap_or_default();
        self.index.associate(key, &tags);
        evicted
    }

    fn associate_detached<S: AsRef<str>>(&mut self, key: &str, tags: &[S], expires: i64) {
        self.index.associate(key, tags);
        if !self.entries.contains_key(key) {
            self.detached.insert(key.to_string(), expires);
        }
    }
}

/// In-process cache tier.
pub struct MemoryTier {
    max_entries: usize,
    keep_evicted_tags: bool,
    clock: SharedClock,
    state: Mutex<MemoryState>,
}

impl MemoryTier {
    /// Create a tier holding at most `max_entries` entries.
    pub fn new(max_entries: usize, clock: SharedClock) -> Self {
        Self {
            max_entries: max_entries.max(1),
            keep_evicted_tags: false,
            clock,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Keep the tags of evicted keys until they expire.
    ///
    /// Set when lower layers may still hold an evicted key.
    pub fn keep_evicted_tags(mut self, keep: bool) -> Self {
        self.keep_evicted_tags = keep;
        self
    }

    /// Capacity.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Fetch a live entry, recording the access.
    ///
    /// An expired entry is removed on the spot, together with its tag
    /// associations.
    pub fn get_entry(&self, key: &str) -> Option<StoredEntry> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let expired = state.entries.get(key)?.entry.is_expired(now);
        if expired {
            state.remove(key);
            trace!(key = %key, "memory entry expired on access");
            return None;
        }
        state.bump(key);
        let slot = state.entries.get_mut(key)?;
        slot.entry.touch(now);
        Some(slot.entry.clone())
    }

    /// Insert or replace an entry, evicting the least recently used entry
    /// when a new key arrives at capacity. Returns the evicted key.
    pub fn insert(&self, key: &str, entry: StoredEntry) -> Option<String> {
        self.state
            .lock()
            .store(key, entry, self.max_entries, self.keep_evicted_tags)
    }

    /// Current invalidation generation.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Copy an entry found in a lower layer back up.
    ///
    /// When `hold` is set the entry is stored here; otherwise only its tags
    /// are indexed. Nothing happens, and `false` is returned, if any key was
    /// invalidated since `generation` was read.
    pub fn backfill(&self, key: &str, entry: &StoredEntry, generation: u64, hold: bool) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        if hold {
            state.store(key, entry.clone(), self.max_entries, self.keep_evicted_tags);
        } else {
            let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
            state.associate_detached(key, &tags, entry.expires);
        }
        true
    }

    /// Remove `key` and its tags as part of an invalidation that has already
    /// reached the lower layers, and advance the generation.
    pub fn invalidate(&self, key: &str) -> Option<StoredEntry> {
        let mut state = self.state.lock();
        state.generation += 1;
        state.remove(key)
    }

    /// Remove an entry and its tag associations.
    pub fn remove(&self, key: &str) -> Option<StoredEntry> {
        self.state.lock().remove(key)
    }

    /// Whether a live entry exists. Does not count as an access.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired(now))
    }

    /// Remove every entry with `expires <= now`. Returns how many were removed.
    pub fn sweep_expired(&self, now: i64) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        let stale_tags: Vec<String> = state
            .detached
            .iter()
            .filter(|(_, expires)| **expires <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale_tags {
            state.remove(key);
        }
        expired.len()
    }

    /// Keys matching a pattern, live entries only.
    pub fn matching_keys(&self, pattern: &KeyPattern) -> Vec<String> {
        let now = self.clock.now_millis();
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(k, slot)| !slot.entry.is_expired(now) && pattern.matches(k))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Estimated bytes held by stored entries.
    pub fn memory_usage(&self) -> usize {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(k, slot)| slot.entry.estimated_size(k))
            .sum()
    }

    /// Drop all entries and all tag associations.
    pub fn clear_all(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.recency.clear();
        state.index.clear();
        state.detached.clear();
        state.generation += 1;
    }

    /// Replace the tag associations of `key`.
    ///
    /// For a key with no entry here, the association is dropped at
    /// `expires` by the sweep.
    pub fn index_associate<S: AsRef<str>>(&self, key: &str, tags: &[S], expires: i64) {
        self.state.lock().associate_detached(key, tags, expires);
    }

    /// Number of indexed keys with no entry here.
    pub fn detached_count(&self) -> usize {
        self.state.lock().detached.len()
    }

    /// Union of keys tagged with any of `tags`.
    pub fn keys_for_tags<S: AsRef<str>>(&self, tags: &[S]) -> HashSet<String> {
        self.state.lock().index.keys_for_tags(tags)
    }

    /// Run a read-only closure against the tag index.
    pub fn with_index<R>(&self, f: impl FnOnce(&TagIndex) -> R) -> R {
        f(&self.state.lock().index)
    }
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("max_entries", &self.max_entries)
            .field("entries", &self.entry_count())
            .finish()
    }
}

#[async_trait]
impl CacheLayer for MemoryTier {
    fn kind(&self) -> LayerKind {
        LayerKind::Memory
    }

    async fn get(&self, key: &str) -> CacheResult<Option<StoredEntry>> {
        Ok(self.get_entry(key))
    }

    async fn set(&self, key: &str, entry: &StoredEntry) -> CacheResult<bool> {
        self.insert(key, entry.clone());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.contains(key))
    }

    async fn keys(&self, pattern: &KeyPattern) -> CacheResult<Vec<String>> {
        Ok(self.matching_keys(pattern))
    }

    async fn clear(&self) -> CacheResult<()> {
        self.clear_all();
        Ok(())
    }

    async fn len(&self) -> CacheResult<usize> {
        Ok(self.entry_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn tier(cap: usize) -> (MemoryTier, Arc<ManualClock>) {
        let clock = ManualClock::shared(1_000_000);
        (MemoryTier::new(cap, clock.clone()), clock)
    }

    fn entry(clock: &ManualClock, value: i64, tags: &[&str]) -> StoredEntry {
        use crate::clock::Clock;
        StoredEntry::new(json!(value), clock.now_millis(), Duration::from_secs(60))
            .with_tags(tags.iter().copied())
    }

    #[tokio::test]
    async fn test_memory_tier_basic() {
        let (cache, clock) = tier(10);
        cache.set("a", &entry(&clock, 1, &[])).await.unwrap();

        let got = cache.get("a").await.unwrap().unwrap();
        assert_eq!(got.data, json!(1));
        assert_eq!(got.metadata.hit_count, 1);

        assert!(cache.delete("a").await.unwrap());
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(!cache.delete("a").await.unwrap());
    }

    #[test]
    fn test_lru_capacity_two() {
        let (cache, clock) = tier(2);
        cache.insert("A", entry(&clock, 1, &["a"]));
        cache.insert("B", entry(&clock, 2, &["b"]));
        assert!(cache.get_entry("A").is_some());

        let evicted = cache.insert("C", entry(&clock, 3, &["c"]));
        assert_eq!(evicted.as_deref(), Some("B"));
        assert!(cache.get_entry("A").is_some());
        assert!(cache.get_entry("B").is_none());
        assert!(cache.get_entry("C").is_some());
        assert!(cache.keys_for_tags(&["b"]).is_empty());
        assert!(cache.with_index(TagIndex::is_symmetric));
    }

    #[test]
    fn test_eviction_keeps_tags_when_layered() {
        let clock = ManualClock::shared(1_000_000);
        let cache = MemoryTier::new(1, clock.clone()).keep_evicted_tags(true);
        cache.insert("a", entry(&clock, 1, &["products"]));
        assert_eq!(cache.insert("b", entry(&clock, 2, &[])).as_deref(), Some("a"));

        assert!(cache.get_entry("a").is_none());
        assert_eq!(cache.keys_for_tags(&["products"]).len(), 1);
        assert_eq!(cache.detached_count(), 1);
        assert!(cache.with_index(TagIndex::is_symmetric));

        // Invalidation drops the kept association.
        let before = cache.generation();
        assert!(cache.invalidate("a").is_none());
        assert!(cache.keys_for_tags(&["products"]).is_empty());
        assert_eq!(cache.detached_count(), 0);
        assert_eq!(cache.generation(), before + 1);
    }

    #[test]
    fn test_sweep_drops_expired_detached_tags() {
        use crate::clock::Clock;
        let clock = ManualClock::shared(1_000_000);
        let cache = MemoryTier::new(1, clock.clone()).keep_evicted_tags(true);
        cache.insert("a", entry(&clock, 1, &["t"]));
        cache.insert("b", entry(&clock, 2, &[]));
        cache.index_associate("remote-only", &["t"], clock.now_millis() + 1_000);
        assert_eq!(cache.keys_for_tags(&["t"]).len(), 2);

        clock.advance(Duration::from_secs(60));
        cache.sweep_expired(clock.now_millis());
        assert!(cache.keys_for_tags(&["t"]).is_empty());
        assert_eq!(cache.detached_count(), 0);
        assert!(cache.with_index(TagIndex::is_symmetric));
    }

    #[test]
    fn test_backfill_skipped_after_invalidation() {
        let (cache, clock) = tier(10);
        let generation = cache.generation();
        cache.invalidate("k");

        assert!(!cache.backfill("k", &entry(&clock, 1, &["t"]), generation, true));
        assert!(cache.get_entry("k").is_none());
        assert!(cache.keys_for_tags(&["t"]).is_empty());

        let generation = cache.generation();
        assert!(cache.backfill("k", &entry(&clock, 1, &["t"]), generation, true));
        assert!(cache.get_entry("k").is_some());
    }

    #[test]
    fn test_replacing_key_does_not_evict() {
        let (cache, clock) = tier(2);
        cache.insert("A", entry(&clock, 1, &[]));
        cache.insert("B", entry(&clock, 2, &[]));
        assert_eq!(cache.insert("A", entry(&clock, 3, &[])), None);
        assert_eq!(cache.entry_count(), 2);
    }

    #[test]
    fn test_passive_expiry_unindexes() {
        let (cache, clock) = tier(10);
        cache.insert("k", entry(&clock, 1, &["t"]));
        clock.advance(Duration::from_secs(60));

        assert!(cache.get_entry("k").is_none());
        assert!(cache.keys_for_tags(&["t"]).is_empty());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_sweep_expired() {
        let (cache, clock) = tier(10);
        cache.insert("old", entry(&clock, 1, &["t"]));
        clock.advance(Duration::from_secs(30));
        cache.insert("new", entry(&clock, 2, &["t"]));
        clock.advance(Duration::from_secs(31));

        use crate::clock::Clock;
        assert_eq!(cache.sweep_expired(clock.now_millis()), 1);
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.keys_for_tags(&["t"]).len(), 1);
        assert!(cache.with_index(TagIndex::is_symmetric));
    }

    #[test]
    fn test_retag_on_overwrite() {
        let (cache, clock) = tier(10);
        cache.insert("k", entry(&clock, 1, &["old"]));
        cache.insert("k", entry(&clock, 2, &["new"]));
        assert!(cache.keys_for_tags(&["old"]).is_empty());
        assert_eq!(cache.keys_for_tags(&["new"]).len(), 1);
    }

    #[tokio::test]
    async fn test_pattern_keys() {
        let (cache, clock) = tier(10);
        for i in 0..3 {
            cache.insert(&format!("app:v1:product:{i}"), entry(&clock, i, &[]));
        }
        cache.insert("app:v1:category:1", entry(&clock, 9, &[]));

        let pattern = KeyPattern::new("app:v1:product:*").unwrap();
        assert_eq!(cache.keys(&pattern).await.unwrap().len(), 3);
    }

    #[test]
    fn test_memory_usage_estimate() {
        let (cache, clock) = tier(10);
        assert_eq!(cache.memory_usage(), 0);
        cache.insert("k", entry(&clock, 1, &[]));
        assert!(cache.memory_usage() >= 64);
        cache.clear_all();
        assert_eq!(cache.memory_usage(), 0);
    }
}
