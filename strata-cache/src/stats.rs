//! Cache statistics and metrics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Thread-safe counters kept by the manager.
pub struct CacheMetrics {
    layer_hits: Vec<(String, AtomicU64)>,
    misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    total_hit_time_ns: AtomicU64,
    created_at: Instant,
}

impl CacheMetrics {
    /// Create counters for the named layers, in scan order.
    pub fn new<I, S>(layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            layer_hits: layers
                .into_iter()
                .map(|name| (name.into(), AtomicU64::new(0)))
                .collect(),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_hit_time_ns: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// Record a hit served by the layer at `index`.
    #[inline]
    pub fn record_hit(&self, index: usize, duration: Duration) {
        if let Some((_, hits)) = self.layer_hits.get(index) {
            hits.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.total_hit_time_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Record a miss across every layer.
    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful write.
    #[inline]
    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful delete.
    #[inline]
    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a layer fault.
    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Hits served by the layer at `index`.
    pub fn layer_hits(&self, index: usize) -> u64 {
        self.layer_hits
            .get(index)
            .map_or(0, |(_, hits)| hits.load(Ordering::Relaxed))
    }

    /// Snapshot the counters. Entry counts and tag counts are filled in by
    /// the manager.
    pub fn snapshot(&self) -> CacheStats {
        let layer_hits: BTreeMap<String, u64> = self
            .layer_hits
            .iter()
            .map(|(name, hits)| (name.clone(), hits.load(Ordering::Relaxed)))
            .collect();
        let hits: u64 = layer_hits.values().sum();
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let total_hit_time_ns = self.total_hit_time_ns.load(Ordering::Relaxed);

        CacheStats {
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            miss_rate: if lookups > 0 {
                misses as f64 / lookups as f64
            } else {
                0.0
            },
            avg_hit_time: if hits > 0 {
                Duration::from_nanos(total_hit_time_ns / hits)
            } else {
                Duration::ZERO
            },
            uptime: self.created_at.elapsed(),
            layer_hits,
            ..CacheStats::default()
        }
    }

    /// Reset all counters.
    pub fn reset(&self) {
        for (_, hits) in &self.layer_hits {
            hits.store(0, Ordering::Relaxed);
        }
        self.misses.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.total_hit_time_ns.store(0, Ordering::Relaxed);
    }
}

impl fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// A snapshot of cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries held by the memory tier.
    pub total_entries: usize,
    /// Estimated memory-tier footprint in bytes.
    pub memory_usage_bytes: usize,
    /// Hits over lookups (0.0 - 1.0).
    pub hit_rate: f64,
    /// Misses over lookups (0.0 - 1.0).
    pub miss_rate: f64,
    /// Keys per tag.
    pub per_tag_count: BTreeMap<String, usize>,
    /// Hits served by each layer.
    pub layer_hits: BTreeMap<String, u64>,
    /// Total hits.
    pub hits: u64,
    /// Lookups that missed every layer.
    pub misses: u64,
    /// Successful writes.
    pub writes: u64,
    /// Successful deletes.
    pub deletes: u64,
    /// Layer faults.
    pub errors: u64,
    /// Mean latency of a hit.
    pub avg_hit_time: Duration,
    /// Time since the manager was built.
    pub uptime: Duration,
}

impl CacheStats {
    /// Hits plus misses.
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// One-line summary.
    pub fn summary(&self) -> String {
        format!(
            "Cache Stats: {} hits, {} misses ({:.1}% hit rate), {} entries, ~{} bytes, {} tags",
            self.hits,
            self.misses,
            self.hit_rate * 100.0,
            self.total_entries,
            self.memory_usage_bytes,
            self.per_tag_count.len(),
        )
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rates() {
        let metrics = CacheMetrics::new(["memory", "remote"]);
        metrics.record_hit(0, Duration::from_micros(10));
        metrics.record_hit(0, Duration::from_micros(30));
        metrics.record_hit(1, Duration::from_micros(20));
        metrics.record_miss();

        let stats = metrics.snapshot();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
        assert!((stats.miss_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(stats.layer_hits.get("memory"), Some(&2));
        assert_eq!(stats.layer_hits.get("remote"), Some(&1));
        assert_eq!(stats.avg_hit_time, Duration::from_micros(20));
    }

    #[test]
    fn test_empty_rates_are_zero() {
        let stats = CacheMetrics::new(["memory"]).snapshot();
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(stats.miss_rate, 0.0);
    }

    #[test]
    fn test_reset() {
        let metrics = CacheMetrics::new(["memory"]);
        metrics.record_hit(0, Duration::ZERO);
        metrics.record_write();
        metrics.reset();
        assert_eq!(metrics.layer_hits(0), 0);
        assert_eq!(metrics.snapshot().writes, 0);
    }

    #[test]
    fn test_summary() {
        let stats = CacheStats {
            hits: 9,
            misses: 1,
            hit_rate: 0.9,
            total_entries: 4,
            ..Default::default()
        };
        assert!(stats.summary().contains("90.0% hit rate"));
    }
}
