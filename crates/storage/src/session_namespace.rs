//! Registry of session (ephemeral) namespaces.
//!
//! Each namespace owns its areas and is operated by at most one permitted
//! connection at a time. Nothing here ever reaches a backing store.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::area::{AreaOwner, StorageArea};
use crate::arena::{AreaArena, AreaId};
use crate::connection::Delivery;
use crate::errors::StorageError;
use crate::local_namespace::force_clear_all;
use crate::types::{ConnectionId, NamespaceId, Origin};

pub struct SessionNamespace {
    permitted: Option<ConnectionId>,
    quota: usize,
    areas: HashMap<Origin, AreaId>,
}

impl SessionNamespace {
    pub fn permitted_connection(&self) -> Option<ConnectionId> { self.permitted }
    pub fn quota(&self) -> usize { self.quota }
    pub fn is_empty(&self) -> bool { self.areas.is_empty() }
    pub fn area_ids(&self) -> impl Iterator<Item = AreaId> + '_ { self.areas.values().copied() }
}

#[derive(Default)]
pub struct SessionNamespaces {
    namespaces: HashMap<NamespaceId, SessionNamespace>,
}

impl SessionNamespaces {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, namespace: NamespaceId) -> Option<&SessionNamespace> { self.namespaces.get(&namespace) }
    pub fn contains(&self, namespace: NamespaceId) -> bool { self.namespaces.contains_key(&namespace) }
    pub fn len(&self) -> usize { self.namespaces.len() }
    pub fn is_empty(&self) -> bool { self.namespaces.is_empty() }

    /// Register an empty namespace. Returns false if the id is already taken.
    pub fn create(&mut self, namespace: NamespaceId, permitted: Option<ConnectionId>, quota: usize) -> bool {
        if self.namespaces.contains_key(&namespace) {
            return false;
        }
        self.namespaces.insert(namespace, SessionNamespace { permitted, quota, areas: HashMap::new() });
        true
    }

    /// Remove the namespace and release its ownership of every area.
    /// Returns the areas nothing else keeps alive.
    pub fn destroy(&mut self, arena: &mut AreaArena, namespace: NamespaceId) -> Vec<StorageArea> {
        let Some(ns) = self.namespaces.remove(&namespace) else { return Vec::new() };
        ns.areas.values().filter_map(|id| arena.release(*id)).collect()
    }

    /// Reassign the permitted connection. Overwriting an occupied slot with a
    /// different connection, without clearing it first, is a protocol violation.
    pub fn set_permitted_connection(&mut self, namespace: NamespaceId, connection: Option<ConnectionId>) -> Result<(), StorageError> {
        let Some(ns) = self.namespaces.get_mut(&namespace) else {
            debug!(%namespace, "permitted connection for unknown session namespace ignored");
            return Ok(());
        };
        if let (Some(new), Some(current)) = (connection, ns.permitted) {
            if new != current {
                return Err(StorageError::protocol(format!(
                    "session namespace {namespace} is already operated by connection {current}"
                )));
            }
        }
        ns.permitted = connection;
        Ok(())
    }

    /// Clear every slot held by a closed connection.
    pub fn release_connection(&mut self, connection: ConnectionId) {
        for ns in self.namespaces.values_mut() {
            if ns.permitted == Some(connection) {
                ns.permitted = None;
            }
        }
    }

    /// Area for `(namespace, origin)`; `None` if the namespace is gone.
    pub fn get_or_create(&mut self, arena: &mut AreaArena, namespace: NamespaceId, origin: Origin) -> Option<AreaId> {
        let ns = self.namespaces.get_mut(&namespace)?;
        if let Some(id) = ns.areas.get(&origin) {
            return Some(*id);
        }
        let id = arena.insert(StorageArea::session(origin.clone(), ns.quota));
        arena.retain(id);
        ns.areas.insert(origin, id);
        Some(id)
    }

    /// Give `destination` an independent copy of every area in `source`.
    pub fn clone_into(&mut self, arena: &mut AreaArena, source: NamespaceId, destination: NamespaceId) -> Result<(), StorageError> {
        let Some(src) = self.namespaces.get(&source) else {
            // the originating context closed before the clone landed
            debug!(%source, %destination, "clone from unknown session namespace ignored");
            return Ok(());
        };
        let copies: Vec<(Origin, StorageArea)> = src
            .areas
            .iter()
            .filter_map(|(origin, id)| arena.get(*id).map(|area| (origin.clone(), area.clone_detached(AreaOwner::Session))))
            .collect();

        let Some(dst) = self.namespaces.get_mut(&destination) else {
            debug!(%source, %destination, "clone into unknown session namespace ignored");
            return Ok(());
        };
        if !dst.areas.is_empty() {
            return Err(StorageError::protocol(format!("clone target session namespace {destination} is not empty")));
        }
        for (origin, area) in copies {
            let id = arena.insert(area);
            arena.retain(id);
            dst.areas.insert(origin, id);
        }
        Ok(())
    }

    pub fn origins(&self, arena: &AreaArena) -> Vec<Origin> {
        let mut origins = BTreeSet::new();
        for ns in self.namespaces.values() {
            for (origin, id) in &ns.areas {
                if arena.get(*id).is_some_and(|a| !a.cached_items().is_empty()) {
                    origins.insert(origin.clone());
                }
            }
        }
        origins.into_iter().collect()
    }

    pub async fn clear_origins_matching(&mut self, arena: &mut AreaArena, origin: &Origin) -> Vec<Delivery> {
        let ids: Vec<AreaId> = self.namespaces.values().filter_map(|ns| ns.areas.get(origin).copied()).collect();
        force_clear_all(arena, &ids).await
    }

    pub async fn clear_all(&mut self, arena: &mut AreaArena) -> Vec<Delivery> {
        let ids: Vec<AreaId> = self.namespaces.values().flat_map(|ns| ns.areas.values().copied()).collect();
        force_clear_all(arena, &ids).await
    }

    /// Drop every namespace (service teardown).
    pub fn clear(&mut self, arena: &mut AreaArena) -> Vec<StorageArea> {
        let ids: Vec<NamespaceId> = self.namespaces.keys().copied().collect();
        ids.into_iter().flat_map(|id| self.destroy(arena, id)).collect()
    }
}
