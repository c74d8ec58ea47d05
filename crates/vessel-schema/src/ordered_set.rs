//! Insertion-ordered, duplicate-free collections used by every list-valued key.

use serde::{Deserialize, Serialize};

/// An element of an [`OrderedSet`].
///
/// `same_entry` decides identity for deduplication (an IP address with a new
/// prefix is the same entry as the old one and replaces it in place).
/// `matches` decides whether a delete pattern removes this entry.
pub trait Entry: Clone + PartialEq {
    fn same_entry(&self, other: &Self) -> bool {
        self == other
    }

    fn matches(&self, pattern: &Self) -> bool {
        self.same_entry(pattern)
    }
}

impl Entry for String {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderedSet<T> {
    items: Vec<T>,
}

impl<T> Default for OrderedSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Entry> OrderedSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the tail, or replace an existing same entry in place.
    /// Returns `true` when the set grew.
    pub fn insert(&mut self, item: T) -> bool {
        if let Some(slot) = self.items.iter_mut().find(|e| e.same_entry(&item)) {
            *slot = item;
            false
        } else {
            self.items.push(item);
            true
        }
    }

    /// Remove every entry matched by `pattern`; returns how many were removed.
    pub fn remove_matching(&mut self, pattern: &T) -> usize {
        let before = self.items.len();
        self.items.retain(|e| !e.matches(pattern));
        before - self.items.len()
    }

    /// Entries of `self` not matched by any entry of `patterns`.
    #[must_use]
    pub fn difference(&self, patterns: &Self) -> Self {
        Self {
            items: self
                .items
                .iter()
                .filter(|e| !patterns.items.iter().any(|p| e.matches(p)))
                .cloned()
                .collect(),
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.iter().any(|e| e.same_entry(item))
    }
}

impl<T> OrderedSet<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.items.retain(f);
    }
}

impl<T: Entry> FromIterator<T> for OrderedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for item in iter {
            set.insert(item);
        }
        set
    }
}

impl<T: Entry> Extend<T> for OrderedSet<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.insert(item);
        }
    }
}

impl<'a, T> IntoIterator for &'a OrderedSet<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T> IntoIterator for OrderedSet<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// A list-valued setting as carried by one configuration layer.
///
/// Persisted and global layers only populate `items`. A command-line layer
/// carries the add set in `items`, the delete set in `delete`, and the
/// "delete all" flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>"))]
pub struct ListParam<T> {
    #[serde(default)]
    pub items: OrderedSet<T>,
    #[serde(default, skip_serializing_if = "OrderedSet::is_empty")]
    pub delete: OrderedSet<T>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete_all: bool,
}

impl<T> Default for ListParam<T> {
    fn default() -> Self {
        Self {
            items: OrderedSet::default(),
            delete: OrderedSet::default(),
            delete_all: false,
        }
    }
}

impl<T: Entry> ListParam<T> {
    pub fn from_items(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: items.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn add(&mut self, item: T) {
        self.delete.remove_matching(&item);
        self.items.insert(item);
    }

    pub fn remove(&mut self, item: T) {
        self.items.remove_matching(&item);
        self.delete.insert(item);
    }

    pub fn remove_all(&mut self) {
        self.delete_all = true;
        self.items.clear();
        self.delete.clear();
    }

    /// True when this layer says nothing about the list.
    pub fn is_untouched(&self) -> bool {
        self.items.is_empty() && self.delete.is_empty() && !self.delete_all
    }
}
