//! Storage area: one origin's key/value map inside one namespace.
//!
//! The area is the unit of quota enforcement and of event fan-out. It never
//! talks to connections itself; every mutation returns the [`Delivery`] list
//! the worker should dispatch.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backing::{BackingStore, OriginDatabase};
use crate::connection::{ClientMessage, Delivery, StorageEvent};
use crate::errors::{QuotaExceeded, StorageError};
use crate::observability;
use crate::storage_map::StorageMap;
use crate::types::{Binding, ConnectionId, MapHandle, NamespaceId, Origin};

/// Which registry an area belongs to, and therefore how it is kept alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaOwner {
    /// Indexed by a local namespace. Disk-backed areas live as long as
    /// bindings address them; memory-only ones are held by the namespace.
    Local(NamespaceId),
    /// Owned by a transient (partitioned) local namespace.
    Transient,
    /// Owned by a session namespace, or a detached clone waiting to be adopted by one.
    Session,
}

/// Lazily opened database for a local area.
struct Persistence {
    store: Arc<dyn BackingStore>,
    database: Option<Box<dyn OriginDatabase>>,
    imported: bool,
}

pub struct StorageArea {
    owner: AreaOwner,
    ephemeral: bool,
    origin: Origin,
    map: StorageMap,
    listeners: BTreeSet<Binding>,
    persistence: Option<Persistence>,
}

impl StorageArea {
    /// Area for a local namespace. Without a backing store it is memory-only.
    pub fn local(namespace: NamespaceId, origin: Origin, quota: usize, store: Option<Arc<dyn BackingStore>>) -> Self {
        Self {
            owner: AreaOwner::Local(namespace),
            ephemeral: store.is_none(),
            origin,
            map: StorageMap::new(quota),
            listeners: BTreeSet::new(),
            persistence: store.map(|store| Persistence { store, database: None, imported: false }),
        }
    }

    pub fn session(origin: Origin, quota: usize) -> Self { Self::memory_only(AreaOwner::Session, origin, quota) }

    pub fn transient(origin: Origin, quota: usize) -> Self { Self::memory_only(AreaOwner::Transient, origin, quota) }

    fn memory_only(owner: AreaOwner, origin: Origin, quota: usize) -> Self {
        Self { owner, ephemeral: true, origin, map: StorageMap::new(quota), listeners: BTreeSet::new(), persistence: None }
    }

    pub fn owner(&self) -> AreaOwner { self.owner }
    pub fn origin(&self) -> &Origin { &self.origin }
    /// Never had a backing store. An area that lost its store after a
    /// failure is still not ephemeral.
    pub fn is_ephemeral(&self) -> bool { self.ephemeral }
    pub fn quota(&self) -> usize { self.map.quota() }
    pub fn is_imported(&self) -> bool { self.persistence.as_ref().is_some_and(|p| p.imported) }
    pub fn is_disk_backed(&self) -> bool { self.persistence.is_some() }
    pub fn has_database_open(&self) -> bool { self.persistence.as_ref().is_some_and(|p| p.database.is_some()) }

    /// Contents without triggering an import.
    pub fn cached_items(&self) -> &HashMap<String, String> { self.map.items() }
    pub fn storage_map(&self) -> &StorageMap { &self.map }

    pub fn add_listener(&mut self, binding: Binding) -> bool { self.listeners.insert(binding) }
    pub fn remove_listener(&mut self, binding: &Binding) -> bool { self.listeners.remove(binding) }
    pub fn has_listener(&self, binding: &Binding) -> bool { self.listeners.contains(binding) }
    pub fn listeners(&self) -> impl Iterator<Item = &Binding> { self.listeners.iter() }

    /// Full contents, importing from the backing store first if needed.
    pub async fn items(&mut self) -> &HashMap<String, String> {
        self.open_database_and_import_if_needed().await;
        self.map.items()
    }

    /// Returns the fan-out list, or `QuotaExceeded` with nothing changed.
    pub async fn set_item(
        &mut self,
        source_connection: ConnectionId,
        source_map: MapHandle,
        key: &str,
        value: &str,
        url: &str,
    ) -> Result<Vec<Delivery>, QuotaExceeded> {
        self.open_database_and_import_if_needed().await;

        let old_value = self.map.set_item(key, value)?;
        if let Some(db) = self.database() {
            let result = db.set_item(key, value).await;
            self.check_write(result);
        }
        Ok(self.dispatch_events(source_connection, source_map, Some(key), old_value, Some(value.to_string()), url))
    }

    pub async fn remove_item(&mut self, source_connection: ConnectionId, source_map: MapHandle, key: &str, url: &str) -> Vec<Delivery> {
        self.open_database_and_import_if_needed().await;

        let Some(old_value) = self.map.remove_item(key) else {
            return Vec::new();
        };
        if let Some(db) = self.database() {
            let result = db.remove_item(key).await;
            self.check_write(result);
        }
        self.dispatch_events(source_connection, source_map, Some(key), Some(old_value), None, url)
    }

    pub async fn clear(&mut self, source_connection: ConnectionId, source_map: MapHandle, url: &str) -> Vec<Delivery> {
        self.open_database_and_import_if_needed().await;

        if self.map.is_empty() {
            return Vec::new();
        }
        self.map.clear();
        if let Some(db) = self.database() {
            let result = db.clear().await;
            self.check_write(result);
        }
        self.dispatch_events(source_connection, source_map, None, None, None, url)
    }

    /// Seed an ephemeral area with items the client already holds.
    /// Stops at the first item that does not fit.
    pub fn import_client_items(&mut self, items: &HashMap<String, String>) {
        if !self.is_ephemeral() {
            return;
        }
        for (key, value) in items {
            if let Err(e) = self.map.set_item(key, value) {
                debug!(origin = %self.origin, error = %e, "client item import stopped at quota");
                return;
            }
        }
    }

    /// Detached memory-only copy sharing the current snapshot, for `owner` to adopt.
    pub fn clone_detached(&self, owner: AreaOwner) -> StorageArea {
        StorageArea {
            owner,
            ephemeral: true,
            origin: self.origin.clone(),
            map: self.map.clone(),
            listeners: BTreeSet::new(),
            persistence: None,
        }
    }

    /// Administrative wipe: empties the map, closes the database, and tells
    /// every listener to drop its cache.
    pub async fn force_clear(&mut self) -> Vec<Delivery> {
        self.map.clear();
        self.close_database().await;

        observability::CACHE_INVALIDATIONS_TOTAL.inc_by(self.listeners.len() as u64);
        self.listeners
            .iter()
            .map(|binding| Delivery { target: *binding, message: ClientMessage::CacheInvalidated })
            .collect()
    }

    /// Open the database ahead of the first access.
    pub async fn prewarm(&mut self) {
        self.open_database_and_import_if_needed().await;
    }

    pub async fn close_database(&mut self) {
        let Some(persistence) = self.persistence.as_mut() else { return };
        if let Some(mut db) = persistence.database.take() {
            if let Err(e) = db.close().await {
                warn!(origin = %self.origin, error = %e, "failed to close local storage database");
            }
        }
    }

    async fn open_database_and_import_if_needed(&mut self) {
        let Some(persistence) = self.persistence.as_mut() else { return };

        // reopen even after import so later writes have somewhere to go
        if persistence.database.is_none() {
            match persistence.store.open(&self.origin).await {
                Ok(db) => persistence.database = Some(db),
                Err(e) => {
                    self.degrade_to_memory(&e);
                    return;
                }
            }
        }
        if persistence.imported {
            return;
        }
        let Some(db) = persistence.database.as_mut() else { return };
        match db.import_items().await {
            Ok(items) => {
                self.map.import_items(items);
                persistence.imported = true;
                debug!(origin = %self.origin, count = self.map.len(), "imported local storage items");
            }
            Err(e) => self.degrade_to_memory(&e),
        }
    }

    fn database(&mut self) -> Option<&mut Box<dyn OriginDatabase>> {
        self.persistence.as_mut().and_then(|p| p.database.as_mut())
    }

    fn check_write(&mut self, result: Result<(), StorageError>) {
        if let Err(e) = result {
            self.degrade_to_memory(&e);
        }
    }

    /// Backing-store failures are never reported to callers; the in-memory map
    /// stays authoritative for the rest of this area's life.
    fn degrade_to_memory(&mut self, error: &StorageError) {
        warn!(origin = %self.origin, error = %error, code = error.code(), "backing store failed; continuing memory-only");
        observability::BACKING_STORE_FAILURES_TOTAL.inc();
        self.persistence = None;
    }

    fn dispatch_events(
        &self,
        source_connection: ConnectionId,
        source_map: MapHandle,
        key: Option<&str>,
        old_value: Option<String>,
        new_value: Option<String>,
        url: &str,
    ) -> Vec<Delivery> {
        observability::STORAGE_EVENTS_TOTAL.inc_by(self.listeners.len() as u64);
        self.listeners
            .iter()
            .map(|binding| {
                let source = if binding.connection == source_connection { source_map } else { MapHandle::NONE };
                Delivery {
                    target: *binding,
                    message: ClientMessage::StorageEvent(StorageEvent {
                        source,
                        key: key.map(str::to_string),
                        old_value: old_value.clone(),
                        new_value: new_value.clone(),
                        url: url.to_string(),
                    }),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::memory::{BackingOp, MemoryBackingStore};
    use pretty_assertions::assert_eq;

    fn origin() -> Origin { Origin::new("https", "example.com", None) }
    fn b(conn: u64, map: u64) -> Binding { Binding::new(ConnectionId(conn), MapHandle(map)) }

    fn event(d: &Delivery) -> &StorageEvent {
        match &d.message {
            ClientMessage::StorageEvent(e) => e,
            other => panic!("expected storage event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fan_out_suppresses_source_for_other_connections() {
        let mut area = StorageArea::session(origin(), 1024);
        area.add_listener(b(1, 10));
        area.add_listener(b(1, 11));
        area.add_listener(b(2, 20));

        let out = area.set_item(ConnectionId(1), MapHandle(10), "k", "v1", "https://example.com/a").await.unwrap();
        assert_eq!(out.len(), 3);
        for d in &out {
            let e = event(d);
            assert_eq!(e.key.as_deref(), Some("k"));
            assert_eq!(e.old_value, None);
            assert_eq!(e.new_value.as_deref(), Some("v1"));
            let expected = if d.target.connection == ConnectionId(1) { MapHandle(10) } else { MapHandle::NONE };
            assert_eq!(e.source, expected);
        }
    }

    #[tokio::test]
    async fn quota_rejection_has_no_side_effects() {
        let store = MemoryBackingStore::new();
        let mut area = StorageArea::local(NamespaceId(1), origin(), 8, Some(Arc::new(store.clone())));
        area.add_listener(b(1, 1));

        let err = area.set_item(ConnectionId(1), MapHandle(1), "key", "too-long-value", "").await.unwrap_err();
        assert_eq!(err.quota, 8);
        assert!(area.cached_items().is_empty());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn remove_and_clear_are_noops_when_nothing_changes() {
        let store = MemoryBackingStore::new();
        let mut area = StorageArea::local(NamespaceId(1), origin(), 1024, Some(Arc::new(store.clone())));
        area.add_listener(b(1, 1));

        assert!(area.remove_item(ConnectionId(1), MapHandle(1), "absent", "").await.is_empty());
        assert!(area.clear(ConnectionId(1), MapHandle(1), "").await.is_empty());
        assert_eq!(store.write_count(), 0);

        area.set_item(ConnectionId(1), MapHandle(1), "k", "v", "").await.unwrap();
        let out = area.clear(ConnectionId(1), MapHandle(1), "u").await;
        assert_eq!(out.len(), 1);
        let e = event(&out[0]);
        assert_eq!((e.key.clone(), e.old_value.clone(), e.new_value.clone()), (None, None, None));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn import_happens_once_and_only_for_local_areas() {
        let store = MemoryBackingStore::new();
        store.seed(origin(), HashMap::from([("saved".to_string(), "1".to_string())]));
        let mut area = StorageArea::local(NamespaceId(1), origin(), 1024, Some(Arc::new(store.clone())));
        assert!(!area.is_imported());

        assert_eq!(area.items().await.get("saved").map(String::as_str), Some("1"));
        assert!(area.is_imported());
        area.items().await;
        area.set_item(ConnectionId(1), MapHandle(1), "k", "v", "").await.unwrap();

        let imports = store.ops().iter().filter(|op| matches!(op, BackingOp::Import(_))).count();
        assert_eq!(imports, 1);

        let mut session = StorageArea::session(origin(), 1024);
        session.items().await;
        assert!(!session.is_imported());
    }

    #[tokio::test]
    async fn backing_failure_degrades_to_memory_only() {
        let store = MemoryBackingStore::new();
        let mut area = StorageArea::local(NamespaceId(1), origin(), 1024, Some(Arc::new(store.clone())));
        area.add_listener(b(2, 5));
        store.set_fail_writes(true);

        let out = area.set_item(ConnectionId(1), MapHandle(1), "k", "v", "").await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(area.cached_items().get("k").map(String::as_str), Some("v"));
        assert!(!area.is_disk_backed());

        // later writes never reach the store again
        store.set_fail_writes(false);
        area.set_item(ConnectionId(1), MapHandle(1), "k2", "v2", "").await.unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn force_clear_invalidates_every_listener_and_closes() {
        let store = MemoryBackingStore::new();
        let mut area = StorageArea::local(NamespaceId(1), origin(), 1024, Some(Arc::new(store.clone())));
        area.add_listener(b(1, 1));
        area.add_listener(b(2, 2));
        area.set_item(ConnectionId(1), MapHandle(1), "k", "v", "").await.unwrap();
        assert!(area.has_database_open());

        let out = area.force_clear().await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.message == ClientMessage::CacheInvalidated));
        assert!(area.cached_items().is_empty());
        assert!(!area.has_database_open());
        assert!(store.ops().contains(&BackingOp::Close(origin())));
    }

    #[tokio::test]
    async fn detached_clone_diverges_independently() {
        let mut area = StorageArea::session(origin(), 1024);
        area.set_item(ConnectionId(1), MapHandle(1), "k", "v", "").await.unwrap();
        area.add_listener(b(1, 1));

        let mut copy = area.clone_detached(AreaOwner::Session);
        assert!(copy.storage_map().shares_items_with(area.storage_map()));
        assert_eq!(copy.listeners().count(), 0);

        copy.set_item(ConnectionId(1), MapHandle(1), "k", "changed", "").await.unwrap();
        assert_eq!(area.cached_items().get("k").map(String::as_str), Some("v"));
        assert_eq!(copy.cached_items().get("k").map(String::as_str), Some("changed"));
    }

    #[test]
    fn client_import_only_applies_to_ephemeral_areas() {
        let items = HashMap::from([("a".to_string(), "1".to_string())]);
        let mut session = StorageArea::session(origin(), 1024);
        session.import_client_items(&items);
        assert_eq!(session.cached_items().len(), 1);

        let mut memory_only = StorageArea::local(NamespaceId(1), origin(), 1024, None);
        memory_only.import_client_items(&items);
        assert_eq!(memory_only.cached_items().len(), 1);

        let store = MemoryBackingStore::new();
        let mut persistent = StorageArea::local(NamespaceId(1), origin(), 1024, Some(Arc::new(store)));
        persistent.import_client_items(&items);
        assert!(persistent.cached_items().is_empty());
    }
}
