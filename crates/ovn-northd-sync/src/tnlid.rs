//! Tunnel key allocator.
//!
//! A [`TunnelKeySet`] is one allocation scope: the global datapath key space,
//! or the port key space of a single datapath. Scopes never share state.

use std::collections::BTreeSet;

use ovn_db::{Smap, SmapExt};

/// Option naming the tunnel key an entity asks for.
pub const REQUESTED_TNL_KEY: &str = "requested-tnl-key";

/// Returns the requested tunnel key from an option map.
///
/// Missing, malformed, negative or oversized values yield 0 (no request).
pub fn requested_tunnel_key(options: &Smap) -> u32 {
    u32::try_from(options.get_int(REQUESTED_TNL_KEY, 0)).unwrap_or(0)
}

/// Occupied keys of one scope plus the rolling allocation hint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelKeySet {
    keys: BTreeSet<u32>,
    hint: u32,
}

fn next_key(key: u32, min: u32, max: u32) -> u32 {
    if key < max && key + 1 >= min {
        key + 1
    } else {
        min
    }
}

impl TunnelKeySet {
    /// Creates an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `key` occupied.
    ///
    /// Returns false if it already was; the caller decides whether that is
    /// a conflict.
    pub fn add(&mut self, key: u32) -> bool {
        self.keys.insert(key)
    }

    /// Releases `key`. Returns false if it was not occupied.
    pub fn remove(&mut self, key: u32) -> bool {
        self.keys.remove(&key)
    }

    /// Returns true if `key` is occupied.
    pub fn present(&self, key: u32) -> bool {
        self.keys.contains(&key)
    }

    /// Occupies and returns the first free key in `[min, max]`, scanning
    /// forward from the key after the hint and wrapping at `max`.
    ///
    /// Returns `None` if the range is full.
    pub fn allocate(&mut self, min: u32, max: u32) -> Option<u32> {
        if min == 0 || min > max {
            return None;
        }

        let span = u64::from(max - min) + 1;
        let mut key = next_key(self.hint, min, max);
        for _ in 0..span {
            if self.keys.insert(key) {
                self.hint = key;
                return Some(key);
            }
            key = next_key(key, min, max);
        }
        None
    }

    /// Returns the number of occupied keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if no key is occupied.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterates over occupied keys in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.keys.iter().copied()
    }
}
