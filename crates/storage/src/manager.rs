//! State owned by the storage worker.
//!
//! Everything here runs on the single worker thread, in submission order, so
//! nothing is locked. Structural races (a binding or namespace that has
//! already gone away) resolve to a logged no-op.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::area::{AreaOwner, StorageArea};
use crate::arena::{AreaArena, AreaId};
use crate::backing::{BackingStore, OriginDetails};
use crate::binding::BindingTable;
use crate::connection::{ClientMessage, Connection, ConnectionRef, Delivery};
use crate::errors::StorageError;
use crate::local_namespace::LocalNamespaces;
use crate::observability::{self, record_op};
use crate::session_namespace::SessionNamespaces;
use crate::transient_namespace::TransientNamespaces;
use crate::types::{Binding, ConnectionId, MapHandle, NamespaceId, Origin};

pub struct StorageManager {
    arena: AreaArena,
    local: LocalNamespaces,
    transient: TransientNamespaces,
    session: SessionNamespaces,
    bindings: BindingTable,
    connections: HashMap<ConnectionId, ConnectionRef>,
    session_quota: usize,
}

impl StorageManager {
    pub fn new(local_quota: usize, session_quota: usize, store: Option<Arc<dyn BackingStore>>) -> Self {
        Self {
            arena: AreaArena::new(),
            local: LocalNamespaces::new(local_quota, store),
            transient: TransientNamespaces::new(local_quota),
            session: SessionNamespaces::new(),
            bindings: BindingTable::new(),
            connections: HashMap::new(),
            session_quota,
        }
    }

    pub fn binding_count(&self) -> usize { self.bindings.len() }
    pub fn area_count(&self) -> usize { self.arena.len() }

    #[instrument(skip(self, connection), fields(connection = %connection.id()))]
    pub async fn create_local_mapping(&mut self, connection: &ConnectionRef, map: MapHandle, namespace: NamespaceId, origin: Origin) {
        record_op("create_local_mapping");
        let binding = Binding::new(connection.id(), map);
        if self.bindings.get(&binding).is_some() {
            report_violation(connection.as_ref(), duplicate_binding(binding));
            return;
        }
        let id = self.local.get_or_create(&mut self.arena, namespace, origin);
        self.bind(connection, binding, id);
    }

    /// Local storage partitioned by the top-level origin it is used under.
    #[instrument(skip(self, connection), fields(connection = %connection.id()))]
    pub async fn create_transient_local_mapping(
        &mut self,
        connection: &ConnectionRef,
        map: MapHandle,
        namespace: NamespaceId,
        top_level_origin: Origin,
        origin: Origin,
    ) {
        record_op("create_transient_local_mapping");
        let binding = Binding::new(connection.id(), map);
        if self.bindings.get(&binding).is_some() {
            report_violation(connection.as_ref(), duplicate_binding(binding));
            return;
        }
        let id = self.transient.get_or_create(&mut self.arena, namespace, top_level_origin, origin);
        self.bind(connection, binding, id);
    }

    #[instrument(skip(self, connection), fields(connection = %connection.id()))]
    pub async fn create_session_mapping(&mut self, connection: &ConnectionRef, map: MapHandle, namespace: NamespaceId, origin: Origin) {
        record_op("create_session_mapping");
        let binding = Binding::new(connection.id(), map);
        let Some(ns) = self.session.get(namespace) else {
            // the browsing context closed before this request landed
            stale("create_session_mapping", binding);
            return;
        };
        if ns.permitted_connection() != Some(connection.id()) {
            let err = StorageError::protocol(format!("connection {} may not operate session namespace {namespace}", connection.id()));
            report_violation(connection.as_ref(), err);
            return;
        }
        if self.bindings.get(&binding).is_some() {
            report_violation(connection.as_ref(), duplicate_binding(binding));
            return;
        }
        let Some(id) = self.session.get_or_create(&mut self.arena, namespace, origin) else { return };
        self.bind(connection, binding, id);
    }

    fn bind(&mut self, connection: &ConnectionRef, binding: Binding, id: AreaId) {
        if let Err(e) = self.bindings.insert(binding, id) {
            report_violation(connection.as_ref(), e);
            return;
        }
        self.arena.retain(id);
        if let Some(area) = self.arena.get_mut(id) {
            area.add_listener(binding);
        }
        self.connections.entry(binding.connection).or_insert_with(|| connection.clone());
        debug!(%binding, "mapping created");
    }

    pub async fn destroy_mapping(&mut self, connection: ConnectionId, map: MapHandle) {
        record_op("destroy_mapping");
        let binding = Binding::new(connection, map);
        let Some(id) = self.bindings.remove(&binding) else {
            stale("destroy_mapping", binding);
            return;
        };
        self.unbind(binding, id).await;
    }

    pub async fn read_all(&mut self, connection: &ConnectionRef, map: MapHandle, seed: u64) {
        record_op("get_values");
        let binding = Binding::new(connection.id(), map);
        let Some(area) = self.resolve(binding) else {
            stale("get_values", binding);
            return;
        };
        let items = area.items().await.clone();
        connection.send(map, ClientMessage::DidGetValues { seed, items });
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn write(
        &mut self,
        connection: &ConnectionRef,
        map: MapHandle,
        source_map: MapHandle,
        seed: u64,
        key: String,
        value: String,
        url: String,
    ) {
        record_op("set_item");
        let binding = Binding::new(connection.id(), map);
        let Some(area) = self.resolve(binding) else {
            stale("set_item", binding);
            return;
        };
        let quota_exceeded = match area.set_item(connection.id(), source_map, &key, &value, &url).await {
            Ok(deliveries) => {
                self.dispatch(deliveries);
                false
            }
            Err(e) => {
                debug!(%binding, key = %key, error = %e, "write rejected");
                observability::QUOTA_EXCEEDED_TOTAL.inc();
                true
            }
        };
        connection.send(map, ClientMessage::DidSetItem { seed, key, quota_exceeded });
    }

    pub async fn remove(&mut self, connection: &ConnectionRef, map: MapHandle, source_map: MapHandle, seed: u64, key: String, url: String) {
        record_op("remove_item");
        let binding = Binding::new(connection.id(), map);
        let Some(area) = self.resolve(binding) else {
            stale("remove_item", binding);
            return;
        };
        let deliveries = area.remove_item(connection.id(), source_map, &key, &url).await;
        self.dispatch(deliveries);
        connection.send(map, ClientMessage::DidRemoveItem { seed, key });
    }

    pub async fn clear(&mut self, connection: &ConnectionRef, map: MapHandle, source_map: MapHandle, seed: u64, url: String) {
        record_op("clear");
        let binding = Binding::new(connection.id(), map);
        let Some(area) = self.resolve(binding) else {
            stale("clear", binding);
            return;
        };
        let deliveries = area.clear(connection.id(), source_map, &url).await;
        self.dispatch(deliveries);
        connection.send(map, ClientMessage::DidClear { seed });
    }

    pub async fn import_items(&mut self, connection: ConnectionId, map: MapHandle, items: HashMap<String, String>) {
        record_op("import_items");
        let binding = Binding::new(connection, map);
        match self.resolve(binding) {
            Some(area) => area.import_client_items(&items),
            None => stale("import_items", binding),
        }
    }

    pub async fn prewarm(&mut self, connection: ConnectionId, map: MapHandle) {
        record_op("prewarm");
        let binding = Binding::new(connection, map);
        match self.resolve(binding) {
            Some(area) => area.prewarm().await,
            None => stale("prewarm", binding),
        }
    }

    pub fn create_session_namespace(&mut self, namespace: NamespaceId, permitted: Option<ConnectionId>, quota: Option<usize>) {
        record_op("create_session_namespace");
        if !self.session.create(namespace, permitted, quota.unwrap_or(self.session_quota)) {
            debug!(%namespace, "session namespace already exists");
        }
    }

    /// Removes the namespace and every binding that still addresses its areas.
    pub async fn destroy_session_namespace(&mut self, namespace: NamespaceId) {
        record_op("destroy_session_namespace");
        let Some(ns) = self.session.get(namespace) else {
            debug!(%namespace, "destroy of unknown session namespace ignored");
            observability::STALE_REFERENCES_TOTAL.inc();
            return;
        };
        let ids: Vec<AreaId> = ns.area_ids().collect();
        for (binding, id) in self.bindings.remove_where_area(&ids) {
            self.unbind(binding, id).await;
        }
        for area in self.session.destroy(&mut self.arena, namespace) {
            self.destroy_area(area).await;
        }
        debug!(%namespace, "session namespace destroyed");
    }

    /// `None` clears the slot. Taking an occupied slot is reported to the
    /// connection that tried.
    pub fn set_permitted_connection(&mut self, namespace: NamespaceId, connection: Option<&ConnectionRef>) {
        record_op("set_permitted_connection");
        if let Err(e) = self.session.set_permitted_connection(namespace, connection.map(|c| c.id())) {
            match connection {
                Some(conn) => report_violation(conn.as_ref(), e),
                None => warn!(%namespace, error = %e, "rejected permitted connection change"),
            }
        }
    }

    /// Memory-only local storage is cloned along with the session namespace.
    pub fn clone_session_namespace(&mut self, source: NamespaceId, destination: NamespaceId) {
        record_op("clone_session_namespace");
        if !self.session.contains(source) {
            // the originating context closed before the clone landed
            debug!(%source, %destination, "clone from unknown session namespace ignored");
            observability::STALE_REFERENCES_TOTAL.inc();
            return;
        }
        if let Err(e) = self.session.clone_into(&mut self.arena, source, destination) {
            warn!(%source, %destination, error = %e, code = e.code(), "session namespace clone rejected");
            observability::PROTOCOL_VIOLATIONS_TOTAL.inc();
            return;
        }
        let cloned = self.local.clone_into(&mut self.arena, source, destination);
        if cloned > 0 {
            debug!(%source, %destination, areas = cloned, "memory-only local storage cloned");
        }
    }

    pub async fn connection_closed(&mut self, connection: ConnectionId) {
        record_op("connection_closed");
        let removed = self.bindings.remove_connection(connection);
        let count = removed.len();
        for (binding, id) in removed {
            self.unbind(binding, id).await;
        }
        self.session.release_connection(connection);
        self.connections.remove(&connection);
        debug!(%connection, bindings = count, "connection closed");
    }

    #[instrument(skip(self))]
    pub async fn delete_origin(&mut self, origin: Origin) {
        record_op("delete_origin");
        let mut deliveries = self.local.clear_origins_matching(&mut self.arena, &origin).await;
        deliveries.extend(self.transient.clear_origins_matching(&mut self.arena, &origin).await);
        self.dispatch(deliveries);
    }

    #[instrument(skip(self))]
    pub async fn delete_all(&mut self) {
        record_op("delete_all");
        let mut deliveries = self.local.clear_all(&mut self.arena).await;
        deliveries.extend(self.transient.clear_all(&mut self.arena).await);
        self.dispatch(deliveries);
    }

    /// Transient storage keeps no modification times and is always wiped.
    #[instrument(skip(self))]
    pub async fn delete_local_origins_modified_since(&mut self, since: DateTime<Utc>) {
        record_op("delete_local_origins_modified_since");
        let mut deliveries = self.transient.clear_all(&mut self.arena).await;
        deliveries.extend(self.local.clear_modified_since(&mut self.arena, since).await);
        self.dispatch(deliveries);
    }

    #[instrument(skip(self))]
    pub async fn delete_session_origin(&mut self, origin: Origin) {
        record_op("delete_session_origin");
        let deliveries = self.session.clear_origins_matching(&mut self.arena, &origin).await;
        self.dispatch(deliveries);
    }

    #[instrument(skip(self))]
    pub async fn delete_all_session_data(&mut self) {
        record_op("delete_all_session_data");
        let deliveries = self.session.clear_all(&mut self.arena).await;
        self.dispatch(deliveries);
    }

    pub async fn local_origins(&self) -> Vec<Origin> {
        let mut origins: BTreeSet<Origin> = self.local.origins(&self.arena).await.into_iter().collect();
        origins.extend(self.transient.origins(&self.arena));
        origins.into_iter().collect()
    }

    pub async fn local_origin_details(&self) -> Vec<OriginDetails> { self.local.origin_details().await }
    pub fn session_origins(&self) -> Vec<Origin> { self.session.origins(&self.arena) }

    /// Final teardown: unbind everything, drop every namespace and close
    /// every open database.
    pub async fn teardown(&mut self) {
        let bindings = self.bindings.drain();
        let count = bindings.len();
        for (binding, id) in bindings {
            self.unbind(binding, id).await;
        }
        for area in self.session.clear(&mut self.arena) {
            self.destroy_area(area).await;
        }
        for area in self.transient.release_all(&mut self.arena) {
            self.destroy_area(area).await;
        }
        for area in self.local.release_all(&mut self.arena) {
            self.destroy_area(area).await;
        }
        for area in self.arena.drain() {
            self.destroy_area(area).await;
        }
        self.connections.clear();
        info!(bindings = count, "storage worker torn down");
    }

    fn resolve(&mut self, binding: Binding) -> Option<&mut StorageArea> {
        let id = self.bindings.get(&binding)?;
        self.arena.get_mut(id)
    }

    async fn unbind(&mut self, binding: Binding, id: AreaId) {
        if let Some(area) = self.arena.get_mut(id) {
            area.remove_listener(&binding);
        }
        if let Some(area) = self.arena.release(id) {
            self.destroy_area(area).await;
        }
    }

    async fn destroy_area(&mut self, mut area: StorageArea) {
        if let AreaOwner::Local(namespace) = area.owner() {
            self.local.on_area_destroyed(namespace, area.origin());
        }
        area.close_database().await;
    }

    fn dispatch(&self, deliveries: Vec<Delivery>) {
        for Delivery { target, message } in deliveries {
            match self.connections.get(&target.connection) {
                Some(conn) => conn.send(target.map, message),
                None => debug!(%target, "no connection for listener; delivery dropped"),
            }
        }
    }
}

fn duplicate_binding(binding: Binding) -> StorageError {
    StorageError::protocol(format!("map handle {} already bound on connection {}", binding.map, binding.connection))
}

fn report_violation(connection: &dyn Connection, error: StorageError) {
    warn!(connection = %connection.id(), error = %error, code = error.code(), "protocol violation");
    observability::PROTOCOL_VIOLATIONS_TOTAL.inc();
    connection.protocol_violation(&error);
}

fn stale(op: &str, binding: Binding) {
    debug!(op, %binding, "stale reference ignored");
    observability::STALE_REFERENCES_TOTAL.inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::memory::MemoryBackingStore;
    use crate::connection::{ChannelConnection, ConnectionEvent};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn origin() -> Origin { Origin::new("https", "example.com", None) }

    fn conn(id: u64) -> (ConnectionRef, UnboundedReceiver<ConnectionEvent>) {
        let (c, rx) = ChannelConnection::new(ConnectionId(id));
        let c: ConnectionRef = c;
        (c, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn local_area_lives_as_long_as_its_bindings() {
        let store = MemoryBackingStore::new();
        let mut manager = StorageManager::new(1024, 1024, Some(Arc::new(store.clone())));
        let (a, _rx_a) = conn(1);
        let (b, _rx_b) = conn(2);

        manager.create_local_mapping(&a, MapHandle(1), NamespaceId(1), origin()).await;
        manager.create_local_mapping(&b, MapHandle(1), NamespaceId(1), origin()).await;
        assert_eq!(manager.area_count(), 1);

        manager.write(&a, MapHandle(1), MapHandle(1), 1, "k".into(), "v".into(), String::new()).await;
        manager.destroy_mapping(ConnectionId(1), MapHandle(1)).await;
        assert_eq!(manager.area_count(), 1);

        manager.connection_closed(ConnectionId(2)).await;
        assert_eq!(manager.area_count(), 0);
        assert!(!manager.local.contains(NamespaceId(1)));
        assert_eq!(store.contents(&origin()).map(|m| m.len()), Some(1));
    }

    #[tokio::test]
    async fn session_mapping_requires_permitted_connection() {
        let mut manager = StorageManager::new(1024, 1024, None);
        let (a, mut rx_a) = conn(1);
        let (b, mut rx_b) = conn(2);

        // unknown namespace: silently ignored
        manager.create_session_mapping(&a, MapHandle(1), NamespaceId(5), origin()).await;
        assert_eq!(manager.binding_count(), 0);
        assert!(drain(&mut rx_a).is_empty());

        manager.create_session_namespace(NamespaceId(5), Some(ConnectionId(1)), None);
        manager.create_session_mapping(&b, MapHandle(1), NamespaceId(5), origin()).await;
        assert!(matches!(drain(&mut rx_b).as_slice(), [ConnectionEvent::Terminated { .. }]));

        manager.create_session_mapping(&a, MapHandle(1), NamespaceId(5), origin()).await;
        assert_eq!(manager.binding_count(), 1);
        assert_eq!(manager.session.get(NamespaceId(5)).map(|ns| ns.quota()), Some(1024));

        manager.connection_closed(ConnectionId(1)).await;
        // the namespace still owns the area
        assert_eq!(manager.area_count(), 1);
        assert_eq!(manager.session.get(NamespaceId(5)).and_then(|ns| ns.permitted_connection()), None);
    }

    #[tokio::test]
    async fn destroying_session_namespace_turns_bindings_stale() {
        let mut manager = StorageManager::new(1024, 1024, None);
        let (a, mut rx_a) = conn(1);
        manager.create_session_namespace(NamespaceId(2), Some(ConnectionId(1)), Some(64));
        manager.create_session_mapping(&a, MapHandle(3), NamespaceId(2), origin()).await;

        manager.destroy_session_namespace(NamespaceId(2)).await;
        assert_eq!(manager.binding_count(), 0);
        assert_eq!(manager.area_count(), 0);

        manager.write(&a, MapHandle(3), MapHandle(3), 1, "k".into(), "v".into(), String::new()).await;
        manager.destroy_mapping(ConnectionId(1), MapHandle(3)).await;
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn memory_only_local_area_outlives_its_bindings() {
        let mut manager = StorageManager::new(1024, 1024, None);
        let (a, mut rx_a) = conn(1);

        manager.create_local_mapping(&a, MapHandle(1), NamespaceId(1), origin()).await;
        manager.write(&a, MapHandle(1), MapHandle(1), 1, "k".into(), "v".into(), String::new()).await;
        manager.destroy_mapping(ConnectionId(1), MapHandle(1)).await;
        assert_eq!(manager.binding_count(), 0);
        assert_eq!(manager.area_count(), 1);

        manager.create_local_mapping(&a, MapHandle(2), NamespaceId(1), origin()).await;
        drain(&mut rx_a);
        manager.read_all(&a, MapHandle(2), 7).await;
        assert_eq!(
            drain(&mut rx_a),
            vec![ConnectionEvent::Message {
                destination: MapHandle(2),
                message: ClientMessage::DidGetValues { seed: 7, items: HashMap::from([("k".to_string(), "v".to_string())]) },
            }]
        );

        manager.teardown().await;
        assert_eq!(manager.area_count(), 0);
        assert!(manager.local.is_empty());
    }

    #[tokio::test]
    async fn transient_mappings_share_per_top_level_origin() {
        let mut manager = StorageManager::new(1024, 1024, None);
        let (a, mut rx_a) = conn(1);
        let top_a = Origin::new("https", "top-a.test", None);
        let top_b = Origin::new("https", "top-b.test", None);

        manager.create_transient_local_mapping(&a, MapHandle(1), NamespaceId(1), top_a.clone(), origin()).await;
        manager.create_transient_local_mapping(&a, MapHandle(2), NamespaceId(1), top_a, origin()).await;
        manager.create_transient_local_mapping(&a, MapHandle(3), NamespaceId(1), top_b, origin()).await;
        assert_eq!(manager.area_count(), 2);

        manager.write(&a, MapHandle(1), MapHandle(1), 1, "k".into(), "v".into(), String::new()).await;
        manager.read_all(&a, MapHandle(3), 2).await;
        let events = drain(&mut rx_a);
        // map 2 sees the write, map 3 lives in another partition
        assert!(events.iter().any(|ev| matches!(
            ev,
            ConnectionEvent::Message { destination: MapHandle(2), message: ClientMessage::StorageEvent(_) }
        )));
        assert!(events.contains(&ConnectionEvent::Message {
            destination: MapHandle(3),
            message: ClientMessage::DidGetValues { seed: 2, items: HashMap::new() },
        }));
        assert_eq!(manager.local_origins().await, vec![origin()]);

        // the duplicate handle is a violation, the partition survives the unbind
        manager.create_transient_local_mapping(&a, MapHandle(1), NamespaceId(1), origin(), origin()).await;
        assert!(matches!(drain(&mut rx_a).as_slice(), [ConnectionEvent::Terminated { .. }]));
        manager.connection_closed(ConnectionId(1)).await;
        assert_eq!(manager.area_count(), 2);

        manager.delete_origin(origin()).await;
        assert!(manager.local_origins().await.is_empty());
    }

    #[tokio::test]
    async fn clone_copies_memory_only_local_storage() {
        let mut manager = StorageManager::new(1024, 1024, None);
        let (a, mut rx_a) = conn(1);
        manager.create_session_namespace(NamespaceId(1), Some(ConnectionId(1)), None);
        manager.create_session_namespace(NamespaceId(2), Some(ConnectionId(1)), None);
        manager.create_local_mapping(&a, MapHandle(1), NamespaceId(1), origin()).await;
        manager.write(&a, MapHandle(1), MapHandle(1), 1, "k".into(), "v".into(), String::new()).await;

        manager.clone_session_namespace(NamespaceId(1), NamespaceId(2));
        manager.create_local_mapping(&a, MapHandle(2), NamespaceId(2), origin()).await;
        drain(&mut rx_a);
        manager.read_all(&a, MapHandle(2), 3).await;
        assert_eq!(
            drain(&mut rx_a),
            vec![ConnectionEvent::Message {
                destination: MapHandle(2),
                message: ClientMessage::DidGetValues { seed: 3, items: HashMap::from([("k".to_string(), "v".to_string())]) },
            }]
        );

        // unknown session source: nothing is cloned
        manager.clone_session_namespace(NamespaceId(9), NamespaceId(3));
        assert!(!manager.local.contains(NamespaceId(3)));
    }

    #[tokio::test]
    async fn teardown_closes_databases() {
        let store = MemoryBackingStore::new();
        let mut manager = StorageManager::new(1024, 1024, Some(Arc::new(store.clone())));
        let (a, _rx) = conn(1);
        manager.create_local_mapping(&a, MapHandle(1), NamespaceId(1), origin()).await;
        manager.prewarm(ConnectionId(1), MapHandle(1)).await;
        manager.create_session_namespace(NamespaceId(1), Some(ConnectionId(1)), None);
        manager.create_session_mapping(&a, MapHandle(2), NamespaceId(1), origin()).await;

        manager.teardown().await;
        assert_eq!(manager.binding_count(), 0);
        assert_eq!(manager.area_count(), 0);
        assert!(manager.session.is_empty());
        assert!(store.ops().contains(&crate::backing::memory::BackingOp::Close(origin())));
    }
}
