//! Copy-on-write key/value map with a byte quota.
//!
//! Clones share one allocation until either side mutates (`Arc::make_mut`),
//! which is what makes session-namespace duplication cheap.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::errors::QuotaExceeded;

/// Quota applied to every local storage origin unless configured otherwise.
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

fn entry_size(key: &str, value: &str) -> usize {
    key.len().saturating_add(value.len())
}

#[derive(Debug, Clone)]
pub struct StorageMap {
    items: Arc<HashMap<String, String>>,
    size: usize,
    quota: usize,
}

impl StorageMap {
    pub fn new(quota: usize) -> Self {
        Self { items: Arc::new(HashMap::new()), size: 0, quota }
    }

    pub fn items(&self) -> &HashMap<String, String> { &self.items }
    pub fn get(&self, key: &str) -> Option<&str> { self.items.get(key).map(String::as_str) }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn quota(&self) -> usize { self.quota }

    /// Serialized size of every `(key, value)` pair, in bytes.
    pub fn size(&self) -> usize { self.size }

    /// Only possible after importing data written under a larger quota.
    pub fn is_over_quota(&self) -> bool { self.size > self.quota }

    /// Whether both maps still point at the same backing allocation.
    pub fn shares_items_with(&self, other: &StorageMap) -> bool {
        Arc::ptr_eq(&self.items, &other.items)
    }

    /// Insert or replace `key`, returning the previous value.
    /// On quota overflow nothing changes.
    pub fn set_item(&mut self, key: &str, value: &str) -> Result<Option<String>, QuotaExceeded> {
        let old_size = self.items.get(key).map(|old| entry_size(key, old)).unwrap_or(0);
        let required = (self.size - old_size).saturating_add(entry_size(key, value));
        if required > self.quota {
            return Err(QuotaExceeded { quota: self.quota, required });
        }
        let old = Arc::make_mut(&mut self.items).insert(key.to_string(), value.to_string());
        self.size = required;
        Ok(old)
    }

    pub fn remove_item(&mut self, key: &str) -> Option<String> {
        if !self.items.contains_key(key) {
            return None;
        }
        let old = Arc::make_mut(&mut self.items).remove(key)?;
        self.size -= entry_size(key, &old);
        Some(old)
    }

    pub fn clear(&mut self) {
        self.items = Arc::new(HashMap::new());
        self.size = 0;
    }

    /// Merge items read from a backing store. Quota is not enforced here:
    /// what is on disk was accepted when it was written. A map left over
    /// quota rejects every write that does not bring it back under.
    pub fn import_items(&mut self, items: HashMap<String, String>) {
        if items.is_empty() {
            return;
        }
        let map = Arc::make_mut(&mut self.items);
        for (key, value) in items {
            let added = entry_size(&key, &value);
            if let Some(old) = map.insert(key.clone(), value) {
                self.size -= entry_size(&key, &old);
            }
            self.size += added;
        }
        if self.is_over_quota() {
            warn!(size = self.size, quota = self.quota, "imported items exceed quota");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn set_replace_remove_tracks_size() {
        let mut m = StorageMap::new(100);
        assert_eq!(m.set_item("k", "v1"), Ok(None));
        assert_eq!(m.size(), 3);
        assert_eq!(m.set_item("k", "value"), Ok(Some("v1".to_string())));
        assert_eq!(m.size(), 6);
        assert_eq!(m.remove_item("k"), Some("value".to_string()));
        assert_eq!(m.size(), 0);
        assert_eq!(m.remove_item("k"), None);
    }

    #[test]
    fn quota_overflow_leaves_map_untouched() {
        let mut m = StorageMap::new(10);
        m.set_item("a", "1234").unwrap();
        let before = m.items().clone();

        let err = m.set_item("b", "1234567").unwrap_err();
        assert_eq!(err, QuotaExceeded { quota: 10, required: 13 });
        assert_eq!(m.items(), &before);
        assert_eq!(m.size(), 5);

        // replacing an existing value only counts the delta
        assert!(m.set_item("a", "123456789").is_ok());
        assert_eq!(m.size(), 10);
    }

    #[test]
    fn clones_share_until_written() {
        let mut a = StorageMap::new(100);
        a.set_item("k", "v").unwrap();
        let mut b = a.clone();
        assert!(a.shares_items_with(&b));

        b.set_item("k", "other").unwrap();
        assert!(!a.shares_items_with(&b));
        assert_eq!(a.get("k"), Some("v"));
        assert_eq!(b.get("k"), Some("other"));

        // removing a missing key must not detach the allocation
        let c = a.clone();
        a.remove_item("missing");
        assert!(a.shares_items_with(&c));
    }

    #[test]
    fn import_over_quota_is_flagged_until_it_shrinks() {
        let mut m = StorageMap::new(4);
        m.import_items(HashMap::from([("key".to_string(), "value".to_string())]));
        assert_eq!(m.size(), 8);
        assert!(m.is_over_quota());
        assert!(m.set_item("x", "y").is_err());
        // a smaller value that still does not fit is rejected too
        assert!(m.set_item("key", "vv").is_err());
        assert_eq!(m.get("key"), Some("value"));

        assert_eq!(m.remove_item("key"), Some("value".to_string()));
        assert!(!m.is_over_quota());
        assert!(m.set_item("x", "y").is_ok());
    }
}
