//! `(connection, map handle) -> area` routing table.

use std::collections::BTreeMap;

use crate::arena::AreaId;
use crate::errors::StorageError;
use crate::types::{Binding, ConnectionId, MapHandle};

#[derive(Default)]
pub struct BindingTable {
    entries: BTreeMap<Binding, AreaId>,
}

impl BindingTable {
    pub fn new() -> Self { Self::default() }

    /// A binding may only be created once; re-creating it is a client bug.
    pub fn insert(&mut self, binding: Binding, area: AreaId) -> Result<(), StorageError> {
        if self.entries.contains_key(&binding) {
            return Err(StorageError::protocol(format!("map handle {} already bound on connection {}", binding.map, binding.connection)));
        }
        self.entries.insert(binding, area);
        Ok(())
    }

    pub fn get(&self, binding: &Binding) -> Option<AreaId> { self.entries.get(binding).copied() }
    pub fn remove(&mut self, binding: &Binding) -> Option<AreaId> { self.entries.remove(binding) }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Every binding owned by `connection`, removed from the table.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Vec<(Binding, AreaId)> {
        let range = Binding::new(connection, MapHandle(0))..=Binding::new(connection, MapHandle(u64::MAX));
        let bindings: Vec<Binding> = self.entries.range(range).map(|(b, _)| *b).collect();
        bindings
            .into_iter()
            .filter_map(|b| self.entries.remove(&b).map(|id| (b, id)))
            .collect()
    }

    /// Every binding that addresses one of `areas`, removed from the table.
    pub fn remove_where_area(&mut self, areas: &[AreaId]) -> Vec<(Binding, AreaId)> {
        let bindings: Vec<Binding> = self.entries.iter().filter(|(_, id)| areas.contains(id)).map(|(b, _)| *b).collect();
        bindings
            .into_iter()
            .filter_map(|b| self.entries.remove(&b).map(|id| (b, id)))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(Binding, AreaId)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}
