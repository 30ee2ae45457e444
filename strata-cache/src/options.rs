//! Per-call options.

use std::borrow::Cow;
use std::time::Duration;

use crate::invalidation::EntityTag;

/// Options for a single write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Time-to-live; the manager default when unset.
    pub ttl: Option<Duration>,
    /// Tags for invalidation.
    pub tags: Vec<String>,
    /// Namespace prepended as `{namespace}:{key}`.
    pub namespace: Option<String>,
}

impl CacheOptions {
    /// Options with a specific TTL.
    pub fn ttl(duration: Duration) -> Self {
        Self {
            ttl: Some(duration),
            ..Default::default()
        }
    }

    /// Set the TTL.
    pub fn with_ttl(mut self, duration: Duration) -> Self {
        self.ttl = Some(duration);
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<EntityTag>) -> Self {
        let tag: EntityTag = tag.into();
        self.tags.push(tag.into());
        self
    }

    /// Add several tags.
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityTag>,
    {
        self.tags.extend(tags.into_iter().map(|t| {
            let tag: EntityTag = t.into();
            String::from(tag)
        }));
        self
    }

    /// Scope the key under a namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// The key after applying the namespace.
    pub fn scoped_key<'a>(&self, key: &'a str) -> Cow<'a, str> {
        match self.namespace {
            Some(ref ns) => Cow::Owned(format!("{ns}:{key}")),
            None => Cow::Borrowed(key),
        }
    }
}

/// Common TTL presets.
pub mod presets {
    use super::*;

    /// One minute, for fast-changing data such as stock levels.
    pub fn short() -> CacheOptions {
        CacheOptions::ttl(Duration::from_secs(60))
    }

    /// Five minutes.
    pub fn medium() -> CacheOptions {
        CacheOptions::ttl(Duration::from_secs(300))
    }

    /// One hour, for reference data such as categories.
    pub fn long() -> CacheOptions {
        CacheOptions::ttl(Duration::from_secs(3600))
    }

    /// One day.
    pub fn daily() -> CacheOptions {
        CacheOptions::ttl(Duration::from_secs(86_400))
    }
}

/// Options for [`remember`](crate::util::remember).
#[derive(Debug, Clone, PartialEq)]
pub struct RememberOptions {
    /// Tags stored with the computed value.
    pub tags: Vec<String>,
    /// Namespace prepended as `{namespace}:{key}`.
    pub namespace: Option<String>,
    /// Jitter fraction; the manager's configured value when unset.
    pub jitter_pct: Option<f64>,
    /// Store a negative marker when the computation reports not-found.
    pub negative_cache: bool,
    /// Marker lifetime; the manager's configured value when unset.
    pub negative_ttl: Option<Duration>,
}

impl Default for RememberOptions {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            namespace: None,
            jitter_pct: None,
            negative_cache: true,
            negative_ttl: None,
        }
    }
}

impl RememberOptions {
    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<EntityTag>) -> Self {
        let tag: EntityTag = tag.into();
        self.tags.push(tag.into());
        self
    }

    /// Scope the key under a namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Override the jitter fraction.
    pub fn with_jitter(mut self, pct: f64) -> Self {
        self.jitter_pct = Some(pct);
        self
    }

    /// Set the negative-cache lifetime.
    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = Some(ttl);
        self
    }

    /// Never store negative markers.
    pub fn without_negative_cache(mut self) -> Self {
        self.negative_cache = false;
        self
    }

    /// Write options for the computed value.
    pub(crate) fn write_options(&self, ttl: Duration) -> CacheOptions {
        CacheOptions {
            ttl: Some(ttl),
            tags: self.tags.clone(),
            namespace: None,
        }
    }
}
