//! The layered cache manager.
//!
//! A [`CacheManager`] reads through an ordered list of layers and returns the
//! first live entry it finds, copying it back into the layers above. Writes
//! and deletes fan out to every layer; a layer that fails is logged and
//! skipped so the cache never fails a request.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         CacheManager                          │
//! │  ┌──────────────┐    ┌──────────────┐    ┌─────────────────┐  │
//! │  │ Memory (LRU) │ -> │ Remote       │ -> │ compute / miss  │  │
//! │  │ + tag index  │    │ (breaker)    │    │                 │  │
//! │  └──────────────┘    └──────────────┘    └─────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use strata_cache::{CacheConfig, CacheManager, CacheOptions, EntityTag};
//! use std::time::Duration;
//!
//! let cache = CacheManager::builder(CacheConfig::memory_only()).build()?;
//! cache.open().await;
//!
//! let opts = CacheOptions::ttl(Duration::from_secs(60))
//!     .with_tag(EntityTag::record("product", 42));
//! cache.set("product:42", &product, &opts).await;
//!
//! let hit: Option<Product> = cache.get("product:42").await;
//!
//! // After the product row changes:
//! cache.invalidate_record("product", 42).await;
//!
//! cache.close().await;
//! ```
//!
//! # Behaviour on failure
//!
//! | Situation | Result |
//! |-----------|--------|
//! | Invalid key | Warning logged, read misses, write is skipped |
//! | Layer error on read | Counted as a miss for that layer |
//! | Layer error on write | Other layers still written |
//! | Undecodable entry | Miss; the key is deleted everywhere |
//! | Remote circuit open | Remote layer behaves as empty |

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, SystemClock, duration_millis};
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, StoredEntry};
use crate::error::{CacheError, CacheResult, NotFound};
use crate::invalidation::{EntityTag, InvalidationEvent};
use crate::key::{KeyNamespace, KeyPattern, validate_key};
use crate::layer::{CacheLayer, LayerKind};
use crate::memory::MemoryTier;
use crate::options::{CacheOptions, RememberOptions};
use crate::remote::{RemoteConnector, RemoteTier, ResilientClient};
use crate::stats::{CacheMetrics, CacheStats};
use crate::sweep::Sweeper;

/// Outcome of a typed lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    /// A live value.
    Hit(T),
    /// A live negative-cache marker: the source of truth has no such record.
    Negative,
    /// Nothing usable in any layer.
    Miss,
}

impl<T> Lookup<T> {
    /// The value, if this was a hit.
    pub fn into_hit(self) -> Option<T> {
        match self {
            Self::Hit(value) => Some(value),
            _ => None,
        }
    }

    /// Whether this was a hit.
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Self::Hit(value) => Lookup::Hit(f(value)),
            Self::Negative => Lookup::Negative,
            Self::Miss => Lookup::Miss,
        }
    }
}

struct ManagerInner {
    config: CacheConfig,
    clock: SharedClock,
    namespace: KeyNamespace,
    memory: Arc<MemoryTier>,
    memory_position: Option<usize>,
    layers: Vec<Arc<dyn CacheLayer>>,
    remote: Option<ResilientClient>,
    metrics: CacheMetrics,
    sweeper: tokio::sync::Mutex<Option<Sweeper>>,
    opened: AtomicBool,
}

/// Coordinates the cache layers, the tag index and the expiry sweeper.
///
/// Cloning is cheap; clones share all state. Build one per process with
/// [`CacheManager::builder`] and pass it to whatever needs caching.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl CacheManager {
    /// Start building a manager.
    pub fn builder(config: CacheConfig) -> CacheManagerBuilder {
        CacheManagerBuilder::new(config)
    }

    /// A memory-only manager with default settings.
    pub fn in_memory() -> Self {
        let config = CacheConfig::memory_only();
        Self::assemble(config, Arc::new(SystemClock), None, Vec::new())
    }

    fn assemble(
        config: CacheConfig,
        clock: SharedClock,
        connector: Option<Arc<dyn RemoteConnector>>,
        extra: Vec<Arc<dyn CacheLayer>>,
    ) -> Self {
        let has_lower = !extra.is_empty()
            || (connector.is_some() && config.layers.contains(&LayerKind::Remote));
        let memory = Arc::new(
            MemoryTier::new(config.max_entries, clock.clone()).keep_evicted_tags(has_lower),
        );
        let mut layers: Vec<Arc<dyn CacheLayer>> = Vec::with_capacity(config.layers.len());
        let mut memory_position = None;
        let mut remote = None;

        for kind in &config.layers {
            match kind {
                LayerKind::Memory => {
                    memory_position = Some(layers.len());
                    layers.push(memory.clone());
                }
                LayerKind::Remote => match connector {
                    Some(ref connector) => {
                        let client = ResilientClient::new(
                            connector.clone(),
                            config.remote.resilience(),
                            clock.clone(),
                        );
                        let tier = RemoteTier::new(client.clone(), clock.clone())
                            .with_key_prefix(config.remote.key_prefix.clone());
                        remote = Some(client);
                        layers.push(Arc::new(tier));
                    }
                    None => {
                        warn!("remote layer configured without a connector, skipping it");
                    }
                },
            }
        }
        layers.extend(extra);

        let metrics = CacheMetrics::new(layers.iter().map(|l| l.name().to_string()));
        let namespace = config.key_namespace();

        Self {
            inner: Arc::new(ManagerInner {
                config,
                clock,
                namespace,
                memory,
                memory_position,
                layers,
                remote,
                metrics,
                sweeper: tokio::sync::Mutex::new(None),
                opened: AtomicBool::new(false),
            }),
        }
    }

    /// Start the expiry sweeper and connect the remote tier.
    ///
    /// Never fails: when the remote tier cannot be reached it starts with its
    /// circuit open and the manager serves from memory. Calling `open` twice
    /// is a no-op.
    pub async fn open(&self) {
        if self.inner.opened.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut sweeper = self.inner.sweeper.lock().await;
            if sweeper.is_none() {
                *sweeper = Some(Sweeper::spawn(
                    &self.inner.memory,
                    self.inner.clock.clone(),
                    self.inner.config.sweep_interval,
                ));
            }
        }

        if let Some(ref remote) = self.inner.remote {
            if remote.start().await {
                info!(endpoint = %remote.endpoint(), "remote tier connected");
            } else {
                warn!(endpoint = %remote.endpoint(), "remote tier unavailable, serving from memory");
            }
        }

        info!(
            layers = ?self.layer_names(),
            max_entries = self.inner.config.max_entries,
            "cache manager opened"
        );
    }

    /// Stop the sweeper and close the remote connection.
    ///
    /// A closed manager keeps serving from memory but is not reopened by a
    /// later [`open`](Self::open).
    pub async fn close(&self) {
        if let Some(sweeper) = self.inner.sweeper.lock().await.take() {
            sweeper.stop().await;
        }
        if let Some(ref remote) = self.inner.remote {
            remote.close().await;
        }
        info!("cache manager closed");
    }

    /// The configuration the manager was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The clock entries are stamped with.
    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Key builder for this manager's namespace and schema version.
    pub fn keys(&self) -> &KeyNamespace {
        &self.inner.namespace
    }

    /// The memory tier.
    pub fn memory(&self) -> &Arc<MemoryTier> {
        &self.inner.memory
    }

    /// The remote client, when a remote layer is configured.
    pub fn remote(&self) -> Option<&ResilientClient> {
        self.inner.remote.as_ref()
    }

    /// Names of the layers in read order.
    pub fn layer_names(&self) -> Vec<String> {
        self.inner
            .layers
            .iter()
            .map(|l| l.name().to_string())
            .collect()
    }

    /// Live counters.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    // ==================== Reads ====================

    /// Get a value.
    ///
    /// Negative markers read as `None`; use [`lookup`](Self::lookup) to tell
    /// them apart from a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.lookup(key).await.into_hit()
    }

    /// Get a value, distinguishing negative markers from misses.
    pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Lookup<T> {
        self.lookup_entry(key).await.map(|entry| entry.data)
    }

    /// Get the full entry, including its expiry and metadata.
    pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        self.lookup_entry(key).await.into_hit()
    }

    /// Typed entry lookup.
    pub async fn lookup_entry<T: DeserializeOwned>(&self, key: &str) -> Lookup<CacheEntry<T>> {
        let Some(entry) = self.find(key).await else {
            return Lookup::Miss;
        };
        if entry.negative {
            debug!(key, "negative cache hit");
            return Lookup::Negative;
        }
        match entry.decode::<T>() {
            Ok(entry) => Lookup::Hit(entry),
            Err(e) => {
                warn!(key, error = %e, "cached value does not match the requested type, dropping it");
                self.inner.metrics.record_error();
                self.delete_everywhere(key).await;
                Lookup::Miss
            }
        }
    }

    async fn find(&self, key: &str) -> Option<StoredEntry> {
        if let Err(e) = validate_key(key) {
            reject("get", key, &e);
            return None;
        }

        let start = Instant::now();
        let now = self.inner.clock.now_millis();
        let generation = self.inner.memory.generation();

        for (index, layer) in self.inner.layers.iter().enumerate() {
            match layer.get(key).await {
                Ok(Some(entry)) if !entry.is_expired(now) => {
                    self.inner.metrics.record_hit(index, start.elapsed());
                    if index > 0 {
                        self.backfill(index, key, &entry, generation);
                    }
                    return Some(entry);
                }
                Ok(_) => {}
                Err(e) => {
                    self.inner.metrics.record_error();
                    warn!(layer = layer.name(), key, error = %e, "cache layer read failed");
                }
            }
        }

        self.inner.metrics.record_miss();
        None
    }

    /// Copy a lower-layer hit into the layers above it, keeping its expiry.
    ///
    /// The memory tier is filled inline and only if nothing was invalidated
    /// since the read began; other upper layers are filled in the background
    /// under the same check.
    fn backfill(&self, found_at: usize, key: &str, entry: &StoredEntry, generation: u64) {
        let memory = &self.inner.memory;
        let hold = self.inner.memory_position.is_some_and(|p| p < found_at);
        if !memory.backfill(key, entry, generation, hold) {
            debug!(key, "invalidated during read, skipping backfill");
            return;
        }

        let upper: Vec<Arc<dyn CacheLayer>> = self.inner.layers[..found_at]
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != self.inner.memory_position)
            .map(|(_, layer)| layer.clone())
            .collect();
        if upper.is_empty() {
            return;
        }

        let memory = memory.clone();
        let key = key.to_string();
        let entry = entry.clone();
        tokio::spawn(async move {
            for layer in upper {
                if memory.generation() != generation {
                    debug!(key = %key, "invalidated during backfill, stopping");
                    return;
                }
                if let Err(e) = layer.set(&key, &entry).await {
                    debug!(layer = layer.name(), key = %key, error = %e, "backfill failed");
                }
            }
        });
    }

    /// Whether any layer holds a live entry for the key.
    pub async fn exists(&self, key: &str) -> bool {
        if let Err(e) = validate_key(key) {
            reject("exists", key, &e);
            return false;
        }
        for layer in &self.inner.layers {
            match layer.exists(key).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    self.inner.metrics.record_error();
                    warn!(layer = layer.name(), key, error = %e, "cache layer exists failed");
                }
            }
        }
        false
    }

    // ==================== Writes ====================

    /// Store a value in every layer.
    ///
    /// Returns whether at least one layer accepted it. The key's tags in the
    /// index are replaced by the tags in `options`.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: &CacheOptions,
    ) -> bool {
        let key = options.scoped_key(key);
        if let Err(e) = validate_key(&key) {
            reject("set", &key, &e);
            return false;
        }

        let ttl = options.ttl.unwrap_or(self.inner.config.default_ttl);
        let now = self.inner.clock.now_millis();
        let entry = match StoredEntry::encode(value, now, ttl) {
            Ok(entry) => entry.with_tags(options.tags.iter().cloned()),
            Err(e) => {
                warn!(key = %key, error = %e, "failed to encode cache value");
                self.inner.metrics.record_error();
                return false;
            }
        };

        self.write_entry(&key, entry).await
    }

    /// Store a negative-cache marker.
    pub async fn set_negative<S: AsRef<str>>(&self, key: &str, ttl: Duration, tags: &[S]) -> bool {
        if let Err(e) = validate_key(key) {
            reject("set_negative", key, &e);
            return false;
        }
        let entry = StoredEntry::negative_marker(self.inner.clock.now_millis(), ttl)
            .with_tags(tags.iter().map(|t| t.as_ref().to_string()));
        let stored = self.write_entry(key, entry).await;
        if stored {
            debug!(key, ttl_ms = duration_millis(ttl), "stored negative marker");
        }
        stored
    }

    async fn write_entry(&self, key: &str, entry: StoredEntry) -> bool {
        let mut stored = false;
        for layer in &self.inner.layers {
            match layer.set(key, &entry).await {
                Ok(accepted) => stored |= accepted,
                Err(e) => {
                    self.inner.metrics.record_error();
                    warn!(layer = layer.name(), key, error = %e, "cache layer write failed");
                }
            }
        }
        if stored {
            self.inner
                .memory
                .index_associate(key, &tag_list(&entry), entry.expires);
            self.inner.metrics.record_write();
        }
        stored
    }

    /// Remove a key from every layer.
    ///
    /// Returns whether any layer had it.
    pub async fn delete(&self, key: &str) -> bool {
        if let Err(e) = validate_key(key) {
            reject("delete", key, &e);
            return false;
        }
        self.delete_everywhere(key).await
    }

    /// Delete from the lower layers first, then from memory together with
    /// the tag index. A read that raced the lower deletes either lands in
    /// memory before the final step and is removed by it, or sees the new
    /// generation and skips its backfill.
    async fn delete_everywhere(&self, key: &str) -> bool {
        let mut removed = false;
        for (index, layer) in self.inner.layers.iter().enumerate() {
            if Some(index) == self.inner.memory_position {
                continue;
            }
            match layer.delete(key).await {
                Ok(had) => removed |= had,
                Err(e) => {
                    self.inner.metrics.record_error();
                    warn!(layer = layer.name(), key, error = %e, "cache layer delete failed");
                }
            }
        }
        if self.inner.memory.invalidate(key).is_some() && self.inner.memory_position.is_some() {
            removed = true;
        }
        if removed {
            self.inner.metrics.record_delete();
        }
        removed
    }

    /// Remove everything from every layer and empty the tag index.
    pub async fn clear(&self) {
        for layer in &self.inner.layers {
            if let Err(e) = layer.clear().await {
                self.inner.metrics.record_error();
                warn!(layer = layer.name(), error = %e, "cache layer clear failed");
            }
        }
        self.inner.memory.clear_all();
        info!("cache cleared");
    }

    // ==================== Invalidation ====================

    /// Remove every key carrying any of the tags.
    ///
    /// Returns how many keys were removed from at least one layer.
    pub async fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let keys = self.inner.memory.keys_for_tags(tags);
        let mut removed = 0;
        for key in keys {
            if self.delete_everywhere(&key).await {
                removed += 1;
            }
        }
        debug!(
            tags = ?tags.iter().map(AsRef::as_ref).collect::<Vec<_>>(),
            removed,
            "invalidated by tags"
        );
        removed
    }

    /// Remove every key matching a glob pattern (`*` only).
    ///
    /// This scans each layer and is much slower than tag invalidation on a
    /// large remote tier.
    pub async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let pattern = KeyPattern::new(pattern)?;
        Ok(self.invalidate_compiled(&pattern).await)
    }

    async fn invalidate_compiled(&self, pattern: &KeyPattern) -> usize {
        let mut keys = BTreeSet::new();
        for layer in &self.inner.layers {
            match layer.keys(pattern).await {
                Ok(found) => keys.extend(found),
                Err(e) => {
                    self.inner.metrics.record_error();
                    warn!(layer = layer.name(), pattern = pattern.as_str(), error = %e, "cache layer scan failed");
                }
            }
        }

        let mut removed = 0;
        for key in keys {
            if self.delete_everywhere(&key).await {
                removed += 1;
            }
        }
        debug!(pattern = pattern.as_str(), removed, "invalidated by pattern");
        removed
    }

    /// Apply a mutation event: its tags, then its patterns.
    pub async fn invalidate_event(&self, event: &InvalidationEvent) -> usize {
        let tags = event.all_tags();
        let mut removed = self.invalidate_by_tags(&tags).await;
        for pattern in &event.patterns {
            removed += self.invalidate_compiled(pattern).await;
        }
        info!(
            entity = %event.entity,
            mutation = %event.kind,
            record = event.record_id.as_deref().unwrap_or("-"),
            removed,
            "cache invalidated after mutation"
        );
        removed
    }

    /// Invalidate everything tagged with an entity kind.
    pub async fn invalidate_entity(&self, entity: &str) -> usize {
        self.invalidate_by_tags(&[EntityTag::collection(entity)]).await
    }

    /// Invalidate everything tagged with one record.
    pub async fn invalidate_record<I: Display>(&self, entity: &str, id: I) -> usize {
        self.invalidate_by_tags(&[EntityTag::record(entity, id)]).await
    }

    // ==================== Memoization ====================

    /// Return the cached value or compute, cache and return it.
    ///
    /// See [`util::remember`](crate::util::remember).
    pub async fn remember<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
        options: RememberOptions,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: NotFound,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        crate::util::remember(self, key, ttl, compute, options).await
    }

    // ==================== Introspection ====================

    /// Statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.inner.metrics.snapshot();
        stats.total_entries = self.inner.memory.entry_count();
        stats.memory_usage_bytes = self.inner.memory.memory_usage();
        stats.per_tag_count = self.inner.memory.with_index(|index| index.tag_counts());
        stats
    }

    /// Tags currently associated with a key.
    pub fn tags_for_key(&self, key: &str) -> BTreeSet<String> {
        self.inner
            .memory
            .with_index(|index| index.tags_for_key(key).into_iter().collect())
    }

    /// Keys currently associated with a tag.
    pub fn keys_for_tag(&self, tag: &str) -> BTreeSet<String> {
        self.inner
            .memory
            .with_index(|index| index.keys_for_tag(tag).into_iter().collect())
    }

    /// Whether the tag index's two maps agree.
    pub fn index_is_symmetric(&self) -> bool {
        self.inner.memory.with_index(|index| index.is_symmetric())
    }

    /// Drop expired memory entries now instead of waiting for the sweeper.
    pub fn sweep_expired(&self) -> usize {
        self.inner
            .memory
            .sweep_expired(self.inner.clock.now_millis())
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("layers", &self.layer_names())
            .field("namespace", &self.inner.namespace)
            .field("entries", &self.inner.memory.entry_count())
            .finish()
    }
}

fn tag_list(entry: &StoredEntry) -> Vec<&str> {
    entry.tags.iter().map(String::as_str).collect()
}

fn reject(op: &str, key: &str, error: &CacheError) {
    warn!(op, key, error = %error, "rejected cache key, bypassing cache");
}

/// Builder for [`CacheManager`].
pub struct CacheManagerBuilder {
    config: CacheConfig,
    clock: Option<SharedClock>,
    connector: Option<Arc<dyn RemoteConnector>>,
    extra_layers: Vec<Arc<dyn CacheLayer>>,
}

impl CacheManagerBuilder {
    /// Create a builder.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: None,
            connector: None,
            extra_layers: Vec::new(),
        }
    }

    /// Use a specific clock.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Connector for the remote layer.
    pub fn remote_connector(mut self, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Append a custom layer below the configured ones.
    pub fn layer(mut self, layer: Arc<dyn CacheLayer>) -> Self {
        self.extra_layers.push(layer);
        self
    }

    /// Validate the configuration and build the manager.
    ///
    /// The manager is inert until [`CacheManager::open`] is called.
    pub fn build(self) -> CacheResult<CacheManager> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        Ok(CacheManager::assemble(
            self.config,
            clock,
            self.connector,
            self.extra_layers,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{FlakyConnector, InMemoryRemote};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Product {
        id: u32,
        name: String,
    }

    fn product(id: u32) -> Product {
        Product {
            id,
            name: format!("product {id}"),
        }
    }

    fn memory_manager(clock: Arc<ManualClock>, max_entries: usize) -> CacheManager {
        CacheManager::builder(CacheConfig::memory_only().with_max_entries(max_entries))
            .clock(clock)
            .build()
            .unwrap()
    }

    fn layered_manager(clock: Arc<ManualClock>) -> (CacheManager, Arc<InMemoryRemote>) {
        let store = Arc::new(InMemoryRemote::new(clock.clone()));
        let connector = Arc::new(FlakyConnector::healthy(store.clone()));
        let manager = CacheManager::builder(CacheConfig::default())
            .clock(clock)
            .remote_connector(connector)
            .build()
            .unwrap();
        (manager, store)
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_set_get_with_tags() {
        let clock = ManualClock::shared(1_000);
        let cache = memory_manager(clock, 100);
        let opts = CacheOptions::ttl(Duration::from_secs(60))
            .with_tags([EntityTag::record("product", 42), EntityTag::collection("products")]);

        assert!(cache.set("product:42", &product(42), &opts).await);
        assert_eq!(cache.get::<Product>("product:42").await, Some(product(42)));
        assert_eq!(
            cache.keys_for_tag("product:42"),
            BTreeSet::from(["product:42".to_string()])
        );
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_tag_invalidation_removes_only_tagged_keys() {
        let clock = ManualClock::shared(1_000);
        let cache = memory_manager(clock, 100);
        let tagged = CacheOptions::default().with_tag("products");
        cache.set("product:1", &product(1), &tagged).await;
        cache.set("product:2", &product(2), &tagged).await;
        cache.set("user:1", &"alice", &CacheOptions::default().with_tag("users")).await;

        assert_eq!(cache.invalidate_by_tags(&["products"]).await, 2);
        assert_eq!(cache.get::<Product>("product:1").await, None);
        assert_eq!(cache.get::<String>("user:1").await, Some("alice".to_string()));
        assert!(cache.keys_for_tag("products").is_empty());
        assert!(cache.index_is_symmetric());
    }

    #[tokio::test]
    async fn test_expiry_is_absence() {
        let clock = ManualClock::shared(1_000);
        let cache = memory_manager(clock.clone(), 100);
        cache
            .set("k", &1, &CacheOptions::ttl(Duration::from_secs(1)))
            .await;
        clock.advance(Duration::from_millis(999));
        assert_eq!(cache.get::<i32>("k").await, Some(1));
        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get::<i32>("k").await, None);
        assert!(!cache.exists("k").await);
    }

    #[tokio::test]
    async fn test_lru_eviction_through_manager() {
        let clock = ManualClock::shared(1_000);
        let cache = memory_manager(clock, 2);
        let opts = CacheOptions::default();
        cache.set("a", &1, &opts).await;
        cache.set("b", &2, &opts).await;
        assert_eq!(cache.get::<i32>("a").await, Some(1));
        cache.set("c", &3, &opts).await;

        assert_eq!(cache.get::<i32>("b").await, None);
        assert_eq!(cache.get::<i32>("a").await, Some(1));
        assert_eq!(cache.get::<i32>("c").await, Some(3));
        assert_eq!(cache.stats().total_entries, 2);
    }

    #[tokio::test]
    async fn test_invalid_key_bypasses_cache() {
        let cache = memory_manager(ManualClock::shared(1_000), 10);
        assert!(!cache.set("", &1, &CacheOptions::default()).await);
        assert!(!cache.set("a${b}", &1, &CacheOptions::default()).await);
        assert_eq!(cache.get::<i32>("").await, None);
        assert!(!cache.delete("").await);
        assert_eq!(cache.stats().total_entries, 0);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_miss_and_drops_key() {
        let cache = memory_manager(ManualClock::shared(1_000), 10);
        cache.set("k", &"text", &CacheOptions::default()).await;
        assert_eq!(cache.get::<u64>("k").await, None);
        assert_eq!(cache.get::<String>("k").await, None);
    }

    #[tokio::test]
    async fn test_negative_marker_lookup() {
        let cache = memory_manager(ManualClock::shared(1_000), 10);
        assert!(
            cache
                .set_negative("cat:7", Duration::from_secs(30), &["category:7"])
                .await
        );
        assert_eq!(cache.lookup::<i32>("cat:7").await, Lookup::Negative);
        assert_eq!(cache.get::<i32>("cat:7").await, None);
        assert_eq!(cache.invalidate_record("category", 7).await, 1);
        assert_eq!(cache.lookup::<i32>("cat:7").await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_remote_hit_backfills_memory() {
        let clock = ManualClock::shared(1_000);
        let (cache, store) = layered_manager(clock.clone());
        cache.open().await;

        let entry = StoredEntry::encode(&product(42), 1_000, Duration::from_secs(60))
            .unwrap()
            .with_tags(["product:42"]);
        store.insert_raw("product:42", entry.to_bytes().unwrap());

        assert_eq!(cache.get::<Product>("product:42").await, Some(product(42)));
        assert_eq!(cache.metrics().layer_hits(1), 1);
        assert_eq!(
            cache.tags_for_key("product:42"),
            BTreeSet::from(["product:42".to_string()])
        );

        let memory = cache.memory().clone();
        wait_for(move || memory.contains("product:42")).await;
        assert_eq!(
            cache.memory().get_entry("product:42").map(|e| e.expires),
            Some(61_000)
        );

        assert_eq!(cache.get::<Product>("product:42").await, Some(product(42)));
        assert_eq!(cache.metrics().layer_hits(0), 1);
        assert_eq!(cache.metrics().layer_hits(1), 1);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_writes_reach_both_layers() {
        let clock = ManualClock::shared(1_000);
        let (cache, store) = layered_manager(clock);
        cache.open().await;

        cache
            .set("k", &"v", &CacheOptions::ttl(Duration::from_secs(10)))
            .await;
        assert!(store.contains("k"));
        assert_eq!(store.ttl_ms("k"), Some(10_000));

        assert!(cache.delete("k").await);
        assert!(!store.contains("k"));
        assert!(!cache.memory().contains("k"));
        cache.close().await;
    }

    #[tokio::test]
    async fn test_remote_outage_degrades_to_memory() {
        let clock = ManualClock::shared(1_000);
        let (cache, store) = layered_manager(clock);
        cache.open().await;
        store.set_unavailable(true);

        assert!(cache.set("k", &1, &CacheOptions::default()).await);
        assert_eq!(cache.get::<i32>("k").await, Some(1));
        cache.close().await;
    }

    #[tokio::test]
    async fn test_pattern_invalidation_spans_layers() {
        let clock = ManualClock::shared(1_000);
        let (cache, store) = layered_manager(clock);
        cache.open().await;

        let ns = cache.keys().clone();
        for id in 1..=3 {
            cache
                .set(&ns.key("order", id).as_str(), &id, &CacheOptions::default())
                .await;
        }
        cache
            .set(&ns.key("user", 1).as_str(), &1, &CacheOptions::default())
            .await;

        let removed = cache
            .invalidate_pattern(ns.kind_pattern("order").as_str())
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.len(), 1);
        assert!(cache.invalidate_pattern("bad;pattern").await.is_err());
        cache.close().await;
    }

    #[tokio::test]
    async fn test_invalidate_event() {
        let cache = memory_manager(ManualClock::shared(1_000), 10);
        cache
            .set("p:1", &1, &CacheOptions::default().with_tag("product:1"))
            .await;
        cache
            .set("list", &[1, 2], &CacheOptions::default().with_tag("product"))
            .await;
        cache
            .set("cat:7", &7, &CacheOptions::default().with_tag("category:7"))
            .await;
        cache
            .set("other", &0, &CacheOptions::default().with_tag("user"))
            .await;

        let event = InvalidationEvent::update("product")
            .with_record(1)
            .with_related("category", 7);
        assert_eq!(cache.invalidate_event(&event).await, 3);
        assert_eq!(cache.get::<i32>("other").await, Some(0));
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let cache = memory_manager(ManualClock::shared(1_000), 10);
        cache
            .set("a", &1, &CacheOptions::default().with_tag("t"))
            .await;
        cache.get::<i32>("a").await;
        cache.get::<i32>("missing").await;

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.per_tag_count.get("t"), Some(&1));
        assert!(stats.memory_usage_bytes > 0);

        cache.clear().await;
        let stats = cache.stats();
        assert_eq!(stats.total_entries, 0);
        assert!(stats.per_tag_count.is_empty());
    }

    #[tokio::test]
    async fn test_delete_unindexes_and_counts() {
        let clock = ManualClock::shared(1_000);
        let (cache, store) = layered_manager(clock);
        cache.open().await;
        cache
            .set("a", &1, &CacheOptions::default().with_tag("t"))
            .await;
        assert!(store.contains("a"));

        assert!(cache.delete("a").await);
        assert!(!store.contains("a"));
        assert!(cache.tags_for_key("a").is_empty());
        assert!(!cache.delete("a").await);
        assert_eq!(cache.stats().deletes, 1);
        cache.close().await;
    }

    fn small_layered_manager(
        clock: Arc<ManualClock>,
        max_entries: usize,
    ) -> (CacheManager, Arc<InMemoryRemote>) {
        let store = Arc::new(InMemoryRemote::new(clock.clone()));
        let connector = Arc::new(FlakyConnector::healthy(store.clone()));
        let manager = CacheManager::builder(CacheConfig::default().with_max_entries(max_entries))
            .clock(clock)
            .remote_connector(connector)
            .build()
            .unwrap();
        (manager, store)
    }

    #[tokio::test]
    async fn test_evicted_key_still_invalidated_remotely() {
        let clock = ManualClock::shared(1_000);
        let (cache, store) = small_layered_manager(clock, 1);
        cache.open().await;

        cache
            .set("a", &1, &CacheOptions::default().with_tag("products"))
            .await;
        cache.set("b", &2, &CacheOptions::default()).await;
        assert!(!cache.memory().contains("a"));
        assert!(store.contains("a"));
        assert_eq!(cache.memory().detached_count(), 1);

        assert_eq!(cache.invalidate_by_tags(&["products"]).await, 1);
        assert!(!store.contains("a"));
        assert_eq!(cache.get::<i32>("a").await, None);
        assert_eq!(cache.memory().detached_count(), 0);
        assert!(cache.index_is_symmetric());
        cache.close().await;
    }

    #[tokio::test]
    async fn test_backfilled_key_is_invalidated() {
        let clock = ManualClock::shared(1_000);
        let (cache, store) = layered_manager(clock);
        cache.open().await;

        let entry = StoredEntry::encode(&1, 1_000, Duration::from_secs(60))
            .unwrap()
            .with_tags(["products"]);
        store.insert_raw("a", entry.to_bytes().unwrap());

        assert_eq!(cache.get::<i32>("a").await, Some(1));
        assert!(cache.memory().contains("a"));

        assert_eq!(cache.invalidate_by_tags(&["products"]).await, 1);
        tokio::task::yield_now().await;
        assert!(!cache.memory().contains("a"));
        assert!(!store.contains("a"));
        assert_eq!(cache.get::<i32>("a").await, None);
        cache.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_read_racing_invalidation_never_resurrects() {
        let clock = ManualClock::shared(1_000);
        let (cache, store) = layered_manager(clock);
        cache.open().await;

        let entry = StoredEntry::encode(&1, 1_000, Duration::from_secs(60))
            .unwrap()
            .with_tags(["products"]);
        for _ in 0..200 {
            store.insert_raw("a", entry.to_bytes().unwrap());
            cache.memory().index_associate("a", &["products"], entry.expires);

            let reader = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get::<i32>("a").await })
            };
            cache.invalidate_by_tags(&["products"]).await;
            reader.await.unwrap();

            assert!(!store.contains("a"));
            assert!(!cache.memory().contains("a"));
            assert!(cache.tags_for_key("a").is_empty());
        }
        cache.close().await;
    }

    #[tokio::test]
    async fn test_namespaced_write() {
        let cache = memory_manager(ManualClock::shared(1_000), 10);
        let opts = CacheOptions::default().in_namespace("tenant1");
        cache.set("k", &1, &opts).await;
        assert_eq!(cache.get::<i32>("tenant1:k").await, Some(1));
        assert_eq!(cache.get::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn test_open_close_idempotent() {
        let cache = memory_manager(ManualClock::shared(1_000), 10);
        cache.open().await;
        cache.open().await;
        cache.close().await;
        cache.close().await;
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = CacheConfig::memory_only().with_max_entries(0);
        assert!(CacheManager::builder(config).build().is_err());
    }
}
