//! Stored records and their tags.

use serde::{Deserialize, Serialize};

/// An auxiliary `(name, value)` pair attached to an item.
///
/// Tags are a multimap: an item may carry several tags with the same name
/// and different values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryTag {
    /// Tag name, e.g. `attr::person.status`.
    pub name: String,
    /// Tag value.
    pub value: String,
}

impl EntryTag {
    /// Creates a tag from anything string-like.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A record fetched from the store.
///
/// `value` is the canonical payload, carried as UTF-8 text. The surrogate
/// row id is exposed so that callers can resume keyset scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Surrogate row id assigned by the backend.
    pub id: i64,
    /// Category the item belongs to.
    pub category: String,
    /// Item name, unique within `(profile, category)`.
    pub name: String,
    /// Canonical payload.
    pub value: String,
    /// Tags attached to the item.
    pub tags: Vec<EntryTag>,
}

impl Entry {
    /// Creates an entry with the given fields.
    pub fn new(
        id: i64,
        category: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
        tags: Vec<EntryTag>,
    ) -> Self {
        Self {
            id,
            category: category.into(),
            name: name.into(),
            value: value.into(),
            tags,
        }
    }

    /// Returns the first value of the named tag, if present.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }

    /// Returns the tags as a sorted set, for order-insensitive comparison.
    pub fn sorted_tags(&self) -> Vec<&EntryTag> {
        let mut tags: Vec<&EntryTag> = self.tags.iter().collect();
        tags.sort();
        tags
    }
}
