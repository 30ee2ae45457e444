//! Cache key naming, validation and glob patterns.
//!
//! Keys follow `{namespace}:{schemaVersion}:{entityKind}:{entityId}[:{subKey}]`,
//! for example `app:2025-01-31:product:1042`. Bumping the schema version makes
//! every old key unreachable; the old entries simply age out.

use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

use crate::error::{CacheError, CacheResult};

/// Longest key accepted by [`validate_key`].
pub const MAX_KEY_LEN: usize = 512;

/// Sequences that look like template or expression injection.
const INJECTION_MARKERS: &[&str] = &["${", "{{", "}}", "<%", "%>", "#{"];

/// Characters a pattern may not contain before reaching a remote `SCAN`.
const PATTERN_METACHARS: &[char] = &[
    ';', '|', '&', '$', '`', '\'', '"', '\\', '<', '>', '(', ')', '{', '}', '[', ']', '!', '?',
    '#',
];

/// Check that a key is safe to hand to any layer.
pub fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::invalid_key(key, "empty key"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CacheError::invalid_key(
            truncate(key, 64),
            format!("longer than {MAX_KEY_LEN} bytes"),
        ));
    }
    if key.chars().any(char::is_control) {
        return Err(CacheError::invalid_key(key, "control character"));
    }
    if let Some(marker) = INJECTION_MARKERS.iter().find(|m| key.contains(**m)) {
        return Err(CacheError::invalid_key(
            key,
            format!("template sequence {marker:?}"),
        ));
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Namespace and schema version shared by every key an application builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    namespace: String,
    schema_version: String,
}

impl KeyNamespace {
    /// Create a namespace.
    pub fn new(namespace: impl Into<String>, schema_version: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            schema_version: schema_version.into(),
        }
    }

    /// The namespace segment.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The schema version segment.
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Key for one entity.
    pub fn key<I: Display>(&self, kind: &str, id: I) -> CacheKey {
        CacheKey::new(self.clone(), kind, id.to_string())
    }

    /// Key for a derived value of one entity (e.g. its reviews).
    pub fn sub_key<I: Display>(&self, kind: &str, id: I, sub: &str) -> CacheKey {
        self.key(kind, id).with_sub_key(sub)
    }

    /// Pattern matching every key of an entity kind under this namespace.
    pub fn kind_pattern(&self, kind: &str) -> KeyPattern {
        KeyPattern::new_unchecked(format!(
            "{}:{}:{}:*",
            self.namespace, self.schema_version, kind
        ))
    }

    /// Pattern matching every key under this namespace and version.
    pub fn all_pattern(&self) -> KeyPattern {
        KeyPattern::new_unchecked(format!("{}:{}:*", self.namespace, self.schema_version))
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self::new("app", "v1")
    }
}

/// A structured cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    ns: KeyNamespace,
    kind: String,
    id: String,
    sub_key: Option<String>,
}

impl CacheKey {
    /// Create a key.
    pub fn new(ns: KeyNamespace, kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            ns,
            kind: kind.into(),
            id: id.into(),
            sub_key: None,
        }
    }

    /// Attach a sub-key.
    pub fn with_sub_key(mut self, sub: impl Into<String>) -> Self {
        self.sub_key = Some(sub.into());
        self
    }

    /// Render the full key string.
    pub fn as_str(&self) -> String {
        let mut key = String::with_capacity(64);
        key.push_str(&self.ns.namespace);
        key.push(':');
        key.push_str(&self.ns.schema_version);
        key.push(':');
        key.push_str(&self.kind);
        key.push(':');
        key.push_str(&self.id);
        if let Some(ref sub) = self.sub_key {
            key.push(':');
            key.push_str(sub);
        }
        key
    }

    /// Entity kind segment.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Entity id segment.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sub-key segment, if any.
    pub fn sub_key(&self) -> Option<&str> {
        self.sub_key.as_deref()
    }

    /// The record tag for this key's entity (`kind:id`).
    pub fn record_tag(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

/// Builder for keys whose id is derived from several parts, such as list
/// queries keyed by their filters.
#[derive(Debug, Default)]
pub struct CacheKeyBuilder {
    ns: Option<KeyNamespace>,
    kind: Option<String>,
    parts: Vec<String>,
    sub_key: Option<String>,
}

impl CacheKeyBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the namespace.
    pub fn namespace(mut self, ns: KeyNamespace) -> Self {
        self.ns = Some(ns);
        self
    }

    /// Set the entity kind.
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Add an id part.
    pub fn part(mut self, part: impl Into<String>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// Add a `name=value` part.
    pub fn field<V: Display>(mut self, name: &str, value: V) -> Self {
        self.parts.push(format!("{name}={value}"));
        self
    }

    /// Add a hash part.
    pub fn hash(mut self, hash: u64) -> Self {
        self.parts.push(format!("{hash:x}"));
        self
    }

    /// Set the sub-key.
    pub fn sub_key(mut self, sub: impl Into<String>) -> Self {
        self.sub_key = Some(sub.into());
        self
    }

    /// Build the key.
    pub fn build(self) -> CacheKey {
        let id = if self.parts.is_empty() {
            "all".to_string()
        } else {
            self.parts.join(",")
        };
        let mut key = CacheKey::new(
            self.ns.unwrap_or_default(),
            self.kind.unwrap_or_else(|| "default".to_string()),
            id,
        );
        key.sub_key = self.sub_key;
        key
    }
}

/// A validated glob pattern over keys. Only `*` is special.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    pattern: String,
}

impl KeyPattern {
    /// Validate and create a pattern.
    ///
    /// Rejects control characters, whitespace and shell metacharacters so the
    /// pattern can be passed to a remote key scan verbatim.
    pub fn new(pattern: impl Into<String>) -> CacheResult<Self> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(CacheError::invalid_pattern(pattern, "empty pattern"));
        }
        if pattern.len() > MAX_KEY_LEN {
            return Err(CacheError::invalid_pattern(
                truncate(&pattern, 64),
                "pattern too long",
            ));
        }
        if let Some(c) = pattern
            .chars()
            .find(|c| c.is_control() || c.is_whitespace() || PATTERN_METACHARS.contains(c))
        {
            return Err(CacheError::invalid_pattern(
                pattern.clone(),
                format!("forbidden character {c:?}"),
            ));
        }
        Ok(Self { pattern })
    }

    /// Create a pattern from segments already known to be safe.
    pub(crate) fn new_unchecked(pattern: String) -> Self {
        Self { pattern }
    }

    /// Pattern matching every key.
    pub fn all() -> Self {
        Self::new_unchecked("*".to_string())
    }

    /// The pattern string.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Check if a key matches.
    pub fn matches(&self, key: &str) -> bool {
        glob_match(&self.pattern, key)
    }

    /// The same pattern behind a remote key prefix.
    pub fn with_prefix(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.pattern)
    }
}

impl Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

/// Glob match with `*` wildcards, backtracking to the last star.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

/// Hash a value into a key part.
pub fn compute_hash<T: Hash>(value: &T) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
