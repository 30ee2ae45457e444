//! Bidirectional tag index.
//!
//! `tag -> keys` answers "what do I delete for this tag" in time proportional
//! to the affected keys; `key -> tags` lets a delete or eviction unhook a key
//! without scanning every tag. Both maps change together, so the relation is
//! always symmetric. The index is not internally synchronized; the memory tier
//! keeps it under the same lock as its entry map.

use std::collections::{BTreeMap, HashMap, HashSet};

/// Tag to key associations and their inverse.
#[derive(Debug, Default, Clone)]
pub struct TagIndex {
    tag_to_keys: HashMap<String, HashSet<String>>,
    key_to_tags: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tags associated with `key`.
    ///
    /// An empty tag set removes the key from the index.
    pub fn associate<I, S>(&mut self, key: &str, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.remove_key(key);

        let tags: HashSet<String> = tags.into_iter().map(|t| t.as_ref().to_string()).collect();
        if tags.is_empty() {
            return;
        }
        for tag in &tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.key_to_tags.insert(key.to_string(), tags);
    }

    /// Drop every association of `key`. Returns whether it had any.
    pub fn remove_key(&mut self, key: &str) -> bool {
        let Some(tags) = self.key_to_tags.remove(key) else {
            return false;
        };
        for tag in tags {
            if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(&tag);
                }
            }
        }
        true
    }

    /// Union of keys carrying any of `tags`.
    pub fn keys_for_tags<S: AsRef<str>>(&self, tags: &[S]) -> HashSet<String> {
        tags.iter()
            .filter_map(|tag| self.tag_to_keys.get(tag.as_ref()))
            .flatten()
            .cloned()
            .collect()
    }

    /// Keys carrying `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> HashSet<String> {
        self.tag_to_keys.get(tag).cloned().unwrap_or_default()
    }

    /// Tags carried by `key`.
    pub fn tags_for_key(&self, key: &str) -> HashSet<String> {
        self.key_to_tags.get(key).cloned().unwrap_or_default()
    }

    /// Number of keys under each tag.
    pub fn tag_counts(&self) -> BTreeMap<String, usize> {
        self.tag_to_keys
            .iter()
            .map(|(tag, keys)| (tag.clone(), keys.len()))
            .collect()
    }

    /// Number of indexed keys.
    pub fn key_count(&self) -> usize {
        self.key_to_tags.len()
    }

    /// Number of distinct tags.
    pub fn tag_count(&self) -> usize {
        self.tag_to_keys.len()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.tag_to_keys.clear();
        self.key_to_tags.clear();
    }

    /// Check that `k ∈ tag_to_keys[t]` exactly when `t ∈ key_to_tags[k]`,
    /// and that no empty sets are retained.
    pub fn is_symmetric(&self) -> bool {
        let forward = self.tag_to_keys.iter().all(|(tag, keys)| {
            !keys.is_empty()
                && keys
                    .iter()
                    .all(|k| self.key_to_tags.get(k).is_some_and(|t| t.contains(tag)))
        });
        let backward = self.key_to_tags.iter().all(|(key, tags)| {
            !tags.is_empty()
                && tags
                    .iter()
                    .all(|t| self.tag_to_keys.get(t).is_some_and(|k| k.contains(key)))
        });
        forward && backward
    }
}
