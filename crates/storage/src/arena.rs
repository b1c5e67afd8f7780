//! Index-addressed storage for every live area.
//!
//! Areas are referenced by [`AreaId`] from the binding table and from both
//! namespace registries, so there is no reference cycle between an area and
//! the registry that indexes it. Each slot counts the holders keeping it
//! alive: one per binding, plus one for a session namespace that owns it.

use std::collections::HashMap;

use crate::area::StorageArea;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AreaId(u64);

struct Slot {
    area: StorageArea,
    holders: usize,
}

#[derive(Default)]
pub struct AreaArena {
    slots: HashMap<AreaId, Slot>,
    next_id: u64,
}

impl AreaArena {
    pub fn new() -> Self { Self::default() }

    /// Store an area with no holders yet; the caller retains it right away.
    pub fn insert(&mut self, area: StorageArea) -> AreaId {
        self.next_id += 1;
        let id = AreaId(self.next_id);
        self.slots.insert(id, Slot { area, holders: 0 });
        id
    }

    pub fn get(&self, id: AreaId) -> Option<&StorageArea> { self.slots.get(&id).map(|s| &s.area) }
    pub fn get_mut(&mut self, id: AreaId) -> Option<&mut StorageArea> { self.slots.get_mut(&id).map(|s| &mut s.area) }

    pub fn retain(&mut self, id: AreaId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.holders += 1;
        }
    }

    /// Drop one holder. Returns the area once nothing keeps it alive, so the
    /// caller can run its destruction path.
    pub fn release(&mut self, id: AreaId) -> Option<StorageArea> {
        let slot = self.slots.get_mut(&id)?;
        slot.holders = slot.holders.saturating_sub(1);
        if slot.holders > 0 {
            return None;
        }
        self.slots.remove(&id).map(|s| s.area)
    }

    pub fn holders(&self, id: AreaId) -> usize { self.slots.get(&id).map_or(0, |s| s.holders) }
    pub fn len(&self) -> usize { self.slots.len() }
    pub fn is_empty(&self) -> bool { self.slots.is_empty() }

    /// Remove every area regardless of holders (service teardown).
    pub fn drain(&mut self) -> Vec<StorageArea> {
        self.slots.drain().map(|(_, s)| s.area).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Origin;

    #[test]
    fn release_destroys_after_last_holder() {
        let mut arena = AreaArena::new();
        let id = arena.insert(StorageArea::session(Origin::new("https", "a.test", None), 10));
        arena.retain(id);
        arena.retain(id);
        assert_eq!(arena.holders(id), 2);

        assert!(arena.release(id).is_none());
        let area = arena.release(id).expect("destroyed on last release");
        assert_eq!(area.origin().host(), "a.test");
        assert!(arena.get(id).is_none());
        assert!(arena.release(id).is_none());
    }
}
