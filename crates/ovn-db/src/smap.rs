//! String-to-string option maps (`options`, `other_config`,
//! `external_ids`).
//!
//! Lookups never fail: a missing or malformed value yields the caller's
//! default.

use std::collections::BTreeMap;

use uuid::Uuid;

/// An OVSDB `map<string,string>` column.
pub type Smap = BTreeMap<String, String>;

/// Typed accessors over an [`Smap`].
pub trait SmapExt {
    /// Returns the raw value of `key`.
    fn get_str(&self, key: &str) -> Option<&str>;

    /// Returns `key` parsed as a signed integer, or `default`.
    fn get_int(&self, key: &str, default: i64) -> i64;

    /// Returns `key` parsed as an unsigned 32-bit integer, or `default`.
    fn get_uint(&self, key: &str, default: u32) -> u32;

    /// Returns `key` parsed as `true`/`false`, or `default`.
    fn get_bool(&self, key: &str, default: bool) -> bool;

    /// Returns `key` parsed as a UUID.
    fn get_uuid(&self, key: &str) -> Option<Uuid>;

    /// Returns the value of `key` if it is present and non-empty.
    fn get_nonempty(&self, key: &str) -> Option<&str> {
        self.get_str(key).filter(|v| !v.is_empty())
    }
}

impl SmapExt for Smap {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }

    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_str(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_uint(&self, key: &str, default: u32) -> u32 {
        self.get_str(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_str(key) {
            Some("true") => true,
            Some("false") => false,
            _ => default,
        }
    }

    fn get_uuid(&self, key: &str) -> Option<Uuid> {
        self.get_str(key).and_then(|v| Uuid::parse_str(v).ok())
    }
}

/// Builds an [`Smap`] from string pairs.
pub fn smap<I, K, V>(pairs: I) -> Smap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
