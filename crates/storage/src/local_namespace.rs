//! Registry of local (persistent) namespaces.
//!
//! With a backing store, entries only index areas and bindings keep them
//! alive: the data is safe on disk once the last binding goes. Without one,
//! the namespace holds every area itself until the service shuts down. A
//! namespace entry is created on first access and disappears with its last
//! area.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::area::{AreaOwner, StorageArea};
use crate::arena::{AreaArena, AreaId};
use crate::backing::{BackingStore, OriginDetails};
use crate::connection::Delivery;
use crate::types::{NamespaceId, Origin};

#[derive(Default)]
struct LocalNamespace {
    areas: HashMap<Origin, AreaId>,
}

pub struct LocalNamespaces {
    namespaces: HashMap<NamespaceId, LocalNamespace>,
    quota: usize,
    store: Option<Arc<dyn BackingStore>>,
}

impl LocalNamespaces {
    pub fn new(quota: usize, store: Option<Arc<dyn BackingStore>>) -> Self {
        Self { namespaces: HashMap::new(), quota, store }
    }

    pub fn quota(&self) -> usize { self.quota }
    pub fn is_memory_only(&self) -> bool { self.store.is_none() }
    pub fn contains(&self, namespace: NamespaceId) -> bool { self.namespaces.contains_key(&namespace) }
    pub fn len(&self) -> usize { self.namespaces.len() }
    pub fn is_empty(&self) -> bool { self.namespaces.is_empty() }

    pub fn find(&self, namespace: NamespaceId, origin: &Origin) -> Option<AreaId> {
        self.namespaces.get(&namespace)?.areas.get(origin).copied()
    }

    /// Existing area for `(namespace, origin)`, or a fresh one with the configured quota.
    pub fn get_or_create(&mut self, arena: &mut AreaArena, namespace: NamespaceId, origin: Origin) -> AreaId {
        let entry = self.namespaces.entry(namespace).or_default();
        if let Some(id) = entry.areas.get(&origin) {
            return *id;
        }
        let area = StorageArea::local(namespace, origin.clone(), self.quota, self.store.clone());
        let id = arena.insert(area);
        if self.store.is_none() {
            arena.retain(id);
        }
        debug!(%namespace, %origin, "created local storage area");
        entry.areas.insert(origin, id);
        id
    }

    /// Give `destination` a copy of every area in `source`, keeping whatever
    /// it already holds for an origin. Only memory-only namespaces are
    /// copied; on-disk data is shared by every namespace anyway.
    pub fn clone_into(&mut self, arena: &mut AreaArena, source: NamespaceId, destination: NamespaceId) -> usize {
        if self.store.is_some() {
            return 0;
        }
        let Some(src) = self.namespaces.get(&source) else { return 0 };
        let copies: Vec<(Origin, StorageArea)> = src
            .areas
            .iter()
            .filter_map(|(origin, id)| arena.get(*id).map(|area| (origin.clone(), area.clone_detached(AreaOwner::Local(destination)))))
            .collect();

        let dst = self.namespaces.entry(destination).or_default();
        let mut cloned = 0;
        for (origin, area) in copies {
            if dst.areas.contains_key(&origin) {
                continue;
            }
            let id = arena.insert(area);
            arena.retain(id);
            dst.areas.insert(origin, id);
            cloned += 1;
        }
        if dst.areas.is_empty() {
            self.namespaces.remove(&destination);
        }
        cloned
    }

    /// Destruction hook for an area owned by `namespace`.
    pub fn on_area_destroyed(&mut self, namespace: NamespaceId, origin: &Origin) {
        let Some(entry) = self.namespaces.get_mut(&namespace) else { return };
        entry.areas.remove(origin);
        if entry.areas.is_empty() {
            self.namespaces.remove(&namespace);
            debug!(%namespace, "local namespace emptied and removed");
        }
    }

    /// Wipe `origin` in every namespace, then delete its database.
    pub async fn clear_origins_matching(&mut self, arena: &mut AreaArena, origin: &Origin) -> Vec<Delivery> {
        let ids: Vec<AreaId> = self.namespaces.values().filter_map(|ns| ns.areas.get(origin).copied()).collect();
        let deliveries = force_clear_all(arena, &ids).await;

        if let Some(store) = &self.store {
            if let Err(e) = store.delete_origin(origin).await {
                warn!(%origin, error = %e, "failed to delete local storage database");
            }
        }
        info!(%origin, areas = ids.len(), "cleared local storage for origin");
        deliveries
    }

    /// Wipe every area in every namespace, then delete all databases.
    pub async fn clear_all(&mut self, arena: &mut AreaArena) -> Vec<Delivery> {
        let ids: Vec<AreaId> = self.namespaces.values().flat_map(|ns| ns.areas.values().copied()).collect();
        let deliveries = force_clear_all(arena, &ids).await;

        if let Some(store) = &self.store {
            if let Err(e) = store.delete_all().await {
                warn!(error = %e, "failed to delete local storage databases");
            }
        }
        info!(areas = ids.len(), "cleared all local storage");
        deliveries
    }

    /// Wipe every origin whose database changed at or after `since`. Nothing
    /// records modification times without a backing store, so memory-only
    /// mode wipes everything.
    pub async fn clear_modified_since(&mut self, arena: &mut AreaArena, since: DateTime<Utc>) -> Vec<Delivery> {
        let Some(store) = self.store.clone() else {
            return self.clear_all(arena).await;
        };
        let origins: Vec<Origin> = match store.origin_details().await {
            Ok(details) => details
                .into_iter()
                .filter(|d| d.modification_time.is_some_and(|t| t >= since))
                .map(|d| d.origin)
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to read local storage modification times");
                return Vec::new();
            }
        };
        let mut deliveries = Vec::new();
        for origin in &origins {
            deliveries.extend(self.clear_origins_matching(arena, origin).await);
        }
        deliveries
    }

    /// Empty without a backing store.
    pub async fn origin_details(&self) -> Vec<OriginDetails> {
        let Some(store) = &self.store else { return Vec::new() };
        store.origin_details().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to read local storage origin details");
            Vec::new()
        })
    }

    /// Drop every namespace (service teardown). Returns the memory-only
    /// areas nothing else keeps alive.
    pub fn release_all(&mut self, arena: &mut AreaArena) -> Vec<StorageArea> {
        let ids: Vec<AreaId> = self.namespaces.drain().flat_map(|(_, ns)| ns.areas.into_values()).collect();
        if self.store.is_some() {
            return Vec::new();
        }
        ids.into_iter().filter_map(|id| arena.release(id)).collect()
    }

    /// Origins holding local data: whatever the backing store knows about,
    /// plus live areas that currently hold items.
    pub async fn origins(&self, arena: &AreaArena) -> Vec<Origin> {
        let mut origins = BTreeSet::new();
        if let Some(store) = &self.store {
            match store.origins().await {
                Ok(found) => origins.extend(found),
                Err(e) => warn!(error = %e, "failed to list local storage origins"),
            }
        }
        for ns in self.namespaces.values() {
            for (origin, id) in &ns.areas {
                if arena.get(*id).is_some_and(|a| !a.cached_items().is_empty()) {
                    origins.insert(origin.clone());
                }
            }
        }
        origins.into_iter().collect()
    }
}

pub(crate) async fn force_clear_all(arena: &mut AreaArena, ids: &[AreaId]) -> Vec<Delivery> {
    let mut deliveries = Vec::new();
    for id in ids {
        if let Some(area) = arena.get_mut(*id) {
            deliveries.extend(area.force_clear().await);
        }
    }
    deliveries
}
