//! Tags and mutation events.
//!
//! Invalidation is a convention: code that writes to the source of truth
//! describes the write as an [`InvalidationEvent`] and hands it to
//! [`CacheManager::invalidate_event`](crate::CacheManager::invalidate_event)
//! once the write has committed. Entries opt in by carrying the matching
//! [`EntityTag`]s when they are cached.

use std::fmt::{self, Display};

use crate::key::KeyPattern;

/// A tag attached to cached entries.
///
/// Tags are free-form; the helpers follow the `kind` / `kind:id` convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityTag {
    value: String,
}

impl EntityTag {
    /// A tag with an arbitrary value.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Tag for everything derived from an entity kind (lists, counts, ...).
    pub fn collection(kind: &str) -> Self {
        Self::new(kind)
    }

    /// Tag for one record.
    pub fn record<I: Display>(kind: &str, id: I) -> Self {
        Self::new(format!("{kind}:{id}"))
    }

    /// The tag value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl AsRef<str> for EntityTag {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl From<&str> for EntityTag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EntityTag {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<EntityTag> for String {
    fn from(tag: EntityTag) -> Self {
        tag.value
    }
}

/// What happened to the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// A record was created.
    Insert,
    /// A record was changed.
    Update,
    /// A record was removed.
    Delete,
    /// Many records changed at once.
    Bulk,
}

impl Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Bulk => "bulk",
        })
    }
}

/// A committed write, described in terms of the tags it makes stale.
#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    /// Kind of write.
    pub kind: MutationKind,
    /// Entity kind written.
    pub entity: String,
    /// Record id, when a single record was written.
    pub record_id: Option<String>,
    /// Additional tags to invalidate.
    pub tags: Vec<EntityTag>,
    /// Key patterns to invalidate through the slower scan path.
    pub patterns: Vec<KeyPattern>,
}

impl InvalidationEvent {
    /// Create an event.
    pub fn new(kind: MutationKind, entity: impl Into<String>) -> Self {
        Self {
            kind,
            entity: entity.into(),
            record_id: None,
            tags: Vec::new(),
            patterns: Vec::new(),
        }
    }

    /// A record was created.
    pub fn insert(entity: impl Into<String>) -> Self {
        Self::new(MutationKind::Insert, entity)
    }

    /// A record was changed.
    pub fn update(entity: impl Into<String>) -> Self {
        Self::new(MutationKind::Update, entity)
    }

    /// A record was removed.
    pub fn delete(entity: impl Into<String>) -> Self {
        Self::new(MutationKind::Delete, entity)
    }

    /// Many records changed.
    pub fn bulk(entity: impl Into<String>) -> Self {
        Self::new(MutationKind::Bulk, entity)
    }

    /// Set the record id.
    pub fn with_record<I: Display>(mut self, id: I) -> Self {
        self.record_id = Some(id.to_string());
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<EntityTag>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Also invalidate a related record, e.g. the category of a product.
    pub fn with_related<I: Display>(self, kind: &str, id: I) -> Self {
        self.with_tag(EntityTag::record(kind, id))
    }

    /// Add a key pattern.
    pub fn with_pattern(mut self, pattern: KeyPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    /// Every tag the event invalidates: the collection tag, the record tag
    /// when there is one, and any extras. Sorted and deduplicated.
    pub fn all_tags(&self) -> Vec<EntityTag> {
        let mut tags = self.tags.clone();
        tags.push(EntityTag::collection(&self.entity));
        if let Some(ref id) = self.record_id {
            tags.push(EntityTag::record(&self.entity, id));
        }
        tags.sort();
        tags.dedup();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tag_helpers() {
        assert_eq!(EntityTag::record("product", 42).value(), "product:42");
        assert_eq!(EntityTag::collection("product").to_string(), "product");
        let s: String = EntityTag::from("x").into();
        assert_eq!(s, "x");
    }

    #[test]
    fn test_event_tags() {
        let event = InvalidationEvent::update("product")
            .with_record(42)
            .with_related("category", 7)
            .with_tag("product");

        let tags: Vec<String> = event.all_tags().into_iter().map(String::from).collect();
        assert_eq!(tags, vec!["category:7", "product", "product:42"]);
    }

    #[test]
    fn test_insert_without_record() {
        let event = InvalidationEvent::insert("review");
        assert_eq!(event.kind, MutationKind::Insert);
        assert_eq!(event.all_tags(), vec![EntityTag::collection("review")]);
        assert_eq!(event.kind.to_string(), "insert");
    }
}
