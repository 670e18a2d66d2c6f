//! Keyed map that remembers what changed since the last pass.
//!
//! Every node output that feeds a change handler is a `TrackedMap`. The map
//! never creates entries implicitly, and each explicit insert or remove is
//! folded into a per-pass delta:
//!
//! | previous delta | operation | resulting delta |
//! |----------------|-----------|-----------------|
//! | none           | insert    | new             |
//! | none           | replace   | updated         |
//! | new            | replace   | new             |
//! | new            | remove    | none            |
//! | updated        | remove    | deleted         |
//! | deleted        | insert    | updated         |
//!
//! A map whose contents were rebuilt with [`TrackedMap::reset`] carries no
//! usable delta: [`TrackedMap::is_tracked`] returns false until the next
//! [`TrackedMap::clear_tracked`], and consumers must recompute instead of
//! reading [`TrackedMap::changes`].

use std::collections::{BTreeMap, BTreeSet};

/// Keys added, modified and removed since the last `clear_tracked`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedChanges<K, V> {
    /// Keys that did not exist at the start of the pass.
    pub new: BTreeSet<K>,
    /// Keys whose value changed during the pass.
    pub updated: BTreeSet<K>,
    /// Keys removed during the pass, with their last value.
    pub deleted: BTreeMap<K, V>,
}

impl<K, V> Default for TrackedChanges<K, V> {
    fn default() -> Self {
        Self {
            new: BTreeSet::new(),
            updated: BTreeSet::new(),
            deleted: BTreeMap::new(),
        }
    }
}

impl<K: Ord, V> TrackedChanges<K, V> {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Returns the total number of changed keys.
    pub fn len(&self) -> usize {
        self.new.len() + self.updated.len() + self.deleted.len()
    }

    fn clear(&mut self) {
        self.new.clear();
        self.updated.clear();
        self.deleted.clear();
    }
}

/// Ordered map with per-pass change tracking.
///
/// # Example
///
/// ```
/// use ovn_inc_common::TrackedMap;
///
/// let mut map: TrackedMap<u32, &str> = TrackedMap::new();
/// map.reset([(1, "sw0")]);
/// assert!(!map.is_tracked());
///
/// map.clear_tracked();
/// map.insert(2, "sw1");
/// assert!(map.is_tracked());
/// assert!(map.changes().new.contains(&2));
/// ```
#[derive(Debug, Clone)]
pub struct TrackedMap<K, V> {
    inner: BTreeMap<K, V>,
    changes: TrackedChanges<K, V>,
    tracked: bool,
}

impl<K, V> TrackedMap<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    /// Creates an empty, untracked map.
    pub fn new() -> Self {
        Self {
            inner: BTreeMap::new(),
            changes: TrackedChanges::default(),
            tracked: false,
        }
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns true if the map contains the given key.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns a reference to the value for the given key.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Returns an iterator over key-value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    /// Returns an iterator over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    /// Returns an iterator over values in key order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }

    /// Inserts or replaces a value and records the change.
    ///
    /// Replacing a value with an equal one records nothing. Returns true if
    /// the map changed.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        match self.inner.get(&key) {
            Some(old) if *old == value => false,
            Some(_) => {
                if !self.changes.new.contains(&key) {
                    self.changes.updated.insert(key.clone());
                }
                self.inner.insert(key, value);
                true
            }
            None => {
                if self.changes.deleted.remove(&key).is_some() {
                    self.changes.updated.insert(key.clone());
                } else {
                    self.changes.new.insert(key.clone());
                }
                self.inner.insert(key, value);
                true
            }
        }
    }

    /// Removes a key and records the deletion.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let old = self.inner.remove(key)?;
        if !self.changes.new.remove(key) {
            self.changes.updated.remove(key);
            self.changes.deleted.insert(key.clone(), old.clone());
        }
        Some(old)
    }

    /// Replaces the whole content without computing a delta.
    ///
    /// The map becomes untracked until the next `clear_tracked`.
    pub fn reset<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.inner = entries.into_iter().collect();
        self.changes.clear();
        self.tracked = false;
    }

    /// Replaces the whole content and records the difference against the
    /// previous content as a delta.
    ///
    /// Unlike [`reset`](Self::reset) the map stays tracked, so consumers
    /// can apply the delta. Returns true if anything changed.
    pub fn replace_all<I>(&mut self, entries: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let next: BTreeMap<K, V> = entries.into_iter().collect();
        let stale: Vec<K> = self
            .inner
            .keys()
            .filter(|k| !next.contains_key(k))
            .cloned()
            .collect();

        let mut changed = false;
        for key in stale {
            changed |= self.remove(&key).is_some();
        }
        for (key, value) in next {
            changed |= self.insert(key, value);
        }
        changed
    }

    /// Returns true if [`changes`](Self::changes) describes every
    /// modification since the last pass.
    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    /// Returns the changes recorded in this pass.
    pub fn changes(&self) -> &TrackedChanges<K, V> {
        &self.changes
    }

    /// Returns true if the map was reset or changed in this pass.
    pub fn has_changes(&self) -> bool {
        !self.tracked || !self.changes.is_empty()
    }

    /// Drops the recorded delta and starts tracking the next pass.
    pub fn clear_tracked(&mut self) {
        self.changes.clear();
        self.tracked = true;
    }

    /// Removes all entries without recording them and marks the map
    /// untracked.
    pub fn clear(&mut self) {
        self.inner.clear();
        self.changes.clear();
        self.tracked = false;
    }
}

impl<K, V> Default for TrackedMap<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}
