//! Registry of transient (partitioned) local storage.
//!
//! Local storage requested under a different top-level origin is kept apart
//! per `(namespace, top-level origin)` and never reaches a backing store.
//! Each partition owns its areas until the service shuts down.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::area::StorageArea;
use crate::arena::{AreaArena, AreaId};
use crate::connection::Delivery;
use crate::local_namespace::force_clear_all;
use crate::types::{NamespaceId, Origin};

type PartitionKey = (NamespaceId, Origin);

pub struct TransientNamespaces {
    partitions: HashMap<PartitionKey, HashMap<Origin, AreaId>>,
    quota: usize,
}

impl TransientNamespaces {
    pub fn new(quota: usize) -> Self {
        Self { partitions: HashMap::new(), quota }
    }

    pub fn len(&self) -> usize { self.partitions.len() }
    pub fn is_empty(&self) -> bool { self.partitions.is_empty() }

    pub fn get_or_create(&mut self, arena: &mut AreaArena, namespace: NamespaceId, top_level: Origin, origin: Origin) -> AreaId {
        let partition = self.partitions.entry((namespace, top_level)).or_default();
        if let Some(id) = partition.get(&origin) {
            return *id;
        }
        let id = arena.insert(StorageArea::transient(origin.clone(), self.quota));
        arena.retain(id);
        debug!(%namespace, %origin, "created transient local storage area");
        partition.insert(origin, id);
        id
    }

    pub fn origins(&self, arena: &AreaArena) -> Vec<Origin> {
        let mut origins = BTreeSet::new();
        for (origin, id) in self.partitions.values().flatten() {
            if arena.get(*id).is_some_and(|a| !a.cached_items().is_empty()) {
                origins.insert(origin.clone());
            }
        }
        origins.into_iter().collect()
    }

    pub async fn clear_origins_matching(&mut self, arena: &mut AreaArena, origin: &Origin) -> Vec<Delivery> {
        let ids: Vec<AreaId> = self.partitions.values().filter_map(|p| p.get(origin).copied()).collect();
        force_clear_all(arena, &ids).await
    }

    pub async fn clear_all(&mut self, arena: &mut AreaArena) -> Vec<Delivery> {
        let ids: Vec<AreaId> = self.partitions.values().flat_map(|p| p.values().copied()).collect();
        force_clear_all(arena, &ids).await
    }

    /// Drop every partition (service teardown).
    pub fn release_all(&mut self, arena: &mut AreaArena) -> Vec<StorageArea> {
        self.partitions
            .drain()
            .flat_map(|(_, p)| p.into_values())
            .filter_map(|id| arena.release(id))
            .collect()
    }
}
