//! In-process backing store.
//!
//! Used for private/ephemeral profiles and as a test double: every call that
//! reaches the store is recorded, and failures can be injected.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{BackingStore, OriginDatabase, OriginDetails};
use crate::errors::StorageError;
use crate::types::Origin;

/// One call observed by a [`MemoryBackingStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackingOp {
    Open(Origin),
    Import(Origin),
    Set { origin: Origin, key: String, value: String },
    Remove { origin: Origin, key: String },
    Clear(Origin),
    Close(Origin),
    DeleteOrigin(Origin),
    DeleteAll,
}

/// `(created, modified)` for one origin.
type Timestamps = (DateTime<Utc>, DateTime<Utc>);

#[derive(Default)]
struct Inner {
    data: BTreeMap<Origin, HashMap<String, String>>,
    times: BTreeMap<Origin, Timestamps>,
    ops: Vec<BackingOp>,
    fail_open: bool,
    fail_writes: bool,
}

#[derive(Clone, Default)]
pub struct MemoryBackingStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackingStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pre-populate an origin as if it had been written in an earlier run.
    pub fn seed(&self, origin: Origin, items: HashMap<String, String>) {
        let mut inner = self.lock();
        let now = Utc::now();
        inner.times.insert(origin.clone(), (now, now));
        inner.data.insert(origin, items);
    }

    /// Pretend `origin` was last written at `at`.
    pub fn set_modified(&self, origin: &Origin, at: DateTime<Utc>) {
        let mut inner = self.lock();
        let entry = inner.times.entry(origin.clone()).or_insert((at, at));
        entry.1 = at;
    }

    /// Snapshot of what is persisted for `origin`.
    pub fn contents(&self, origin: &Origin) -> Option<HashMap<String, String>> {
        self.lock().data.get(origin).cloned()
    }

    pub fn ops(&self) -> Vec<BackingOp> { self.lock().ops.clone() }

    /// Number of calls that would have modified persisted data.
    pub fn write_count(&self) -> usize {
        self.lock()
            .ops
            .iter()
            .filter(|op| matches!(op, BackingOp::Set { .. } | BackingOp::Remove { .. } | BackingOp::Clear(_)))
            .count()
    }

    pub fn set_fail_open(&self, fail: bool) { self.lock().fail_open = fail; }
    pub fn set_fail_writes(&self, fail: bool) { self.lock().fail_writes = fail; }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn open(&self, origin: &Origin) -> Result<Box<dyn OriginDatabase>, StorageError> {
        let mut inner = self.lock();
        inner.ops.push(BackingOp::Open(origin.clone()));
        if inner.fail_open {
            return Err(StorageError::Backend(format!("cannot open database for {origin}")));
        }
        Ok(Box::new(MemoryOriginDatabase { origin: origin.clone(), store: self.clone() }))
    }

    async fn delete_origin(&self, origin: &Origin) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.ops.push(BackingOp::DeleteOrigin(origin.clone()));
        inner.data.remove(origin);
        inner.times.remove(origin);
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.ops.push(BackingOp::DeleteAll);
        inner.data.clear();
        inner.times.clear();
        Ok(())
    }

    async fn origins(&self) -> Result<Vec<Origin>, StorageError> {
        Ok(self.lock().data.iter().filter(|(_, items)| !items.is_empty()).map(|(o, _)| o.clone()).collect())
    }

    async fn origin_details(&self) -> Result<Vec<OriginDetails>, StorageError> {
        let inner = self.lock();
        let details = inner
            .data
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(origin, _)| {
                let times = inner.times.get(origin);
                OriginDetails {
                    origin: origin.clone(),
                    creation_time: times.map(|t| t.0),
                    modification_time: times.map(|t| t.1),
                }
            })
            .collect();
        Ok(details)
    }
}

struct MemoryOriginDatabase {
    origin: Origin,
    store: MemoryBackingStore,
}

impl MemoryOriginDatabase {
    fn write<F>(&self, op: BackingOp, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut HashMap<String, String>),
    {
        let mut inner = self.store.lock();
        inner.ops.push(op);
        if inner.fail_writes {
            return Err(StorageError::Backend(format!("write failed for {}", self.origin)));
        }
        f(inner.data.entry(self.origin.clone()).or_default());
        let now = Utc::now();
        inner.times.entry(self.origin.clone()).or_insert((now, now)).1 = now;
        Ok(())
    }
}

#[async_trait]
impl OriginDatabase for MemoryOriginDatabase {
    async fn import_items(&mut self) -> Result<HashMap<String, String>, StorageError> {
        let mut inner = self.store.lock();
        inner.ops.push(BackingOp::Import(self.origin.clone()));
        Ok(inner.data.get(&self.origin).cloned().unwrap_or_default())
    }

    async fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let op = BackingOp::Set { origin: self.origin.clone(), key: key.to_string(), value: value.to_string() };
        self.write(op, |m| {
            m.insert(key.to_string(), value.to_string());
        })
    }

    async fn remove_item(&mut self, key: &str) -> Result<(), StorageError> {
        let op = BackingOp::Remove { origin: self.origin.clone(), key: key.to_string() };
        self.write(op, |m| {
            m.remove(key);
        })
    }

    async fn clear(&mut self) -> Result<(), StorageError> {
        self.write(BackingOp::Clear(self.origin.clone()), HashMap::clear)
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.store.lock().ops.push(BackingOp::Close(self.origin.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_records_and_fails_on_demand() -> Result<(), anyhow::Error> {
        let store = MemoryBackingStore::new();
        let origin = Origin::parse("https://example.com")?;
        store.seed(origin.clone(), HashMap::from([("k".to_string(), "v".to_string())]));

        let mut db = store.open(&origin).await?;
        assert_eq!(db.import_items().await?.get("k").map(String::as_str), Some("v"));
        db.set_item("k2", "v2").await?;
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.contents(&origin).map(|m| m.len()), Some(2));

        store.set_fail_writes(true);
        assert!(db.remove_item("k").await.is_err());
        assert_eq!(store.contents(&origin).map(|m| m.len()), Some(2));

        store.set_fail_open(true);
        assert!(store.open(&origin).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn memory_store_tracks_modification_times() -> Result<(), anyhow::Error> {
        let store = MemoryBackingStore::new();
        let origin = Origin::parse("https://example.com")?;
        let long_ago = Utc::now() - chrono::Duration::days(30);
        store.seed(origin.clone(), HashMap::from([("k".to_string(), "v".to_string())]));
        store.set_modified(&origin, long_ago);

        let details = store.origin_details().await?;
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].modification_time, Some(long_ago));

        let mut db = store.open(&origin).await?;
        db.set_item("k", "w").await?;
        let details = store.origin_details().await?;
        assert!(details[0].modification_time.is_some_and(|t| t > long_ago));

        store.delete_origin(&origin).await?;
        assert!(store.origin_details().await?.is_empty());
        Ok(())
    }
}
