//! Public facade of the storage service.
//!
//! Every operation is turned into a [`Task`] and pushed onto an unbounded
//! queue drained by one dedicated worker thread running a current-thread
//! tokio runtime. Submission never blocks; only [`StorageService::shutdown`]
//! waits for the worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use prometheus::IntGauge;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::backing::{BackingStore, OriginDetails};
use crate::connection::ConnectionRef;
use crate::errors::StorageError;
use crate::manager::StorageManager;
use crate::observability::QUEUED_TASKS;
use crate::storage_map::DEFAULT_QUOTA_BYTES;
use crate::types::{ConnectionId, MapHandle, NamespaceId, Origin};

const WORKER_THREAD_NAME: &str = "storage-worker";

/// Quotas the worker starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageOptions {
    pub local_quota_bytes: usize,
    pub session_quota_bytes: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self { local_quota_bytes: DEFAULT_QUOTA_BYTES, session_quota_bytes: DEFAULT_QUOTA_BYTES }
    }
}

impl From<&configs::StorageConfig> for StorageOptions {
    fn from(cfg: &configs::StorageConfig) -> Self {
        Self { local_quota_bytes: cfg.local_quota_bytes, session_quota_bytes: cfg.session_quota_bytes }
    }
}

enum Task {
    CreateLocalMapping { connection: ConnectionRef, map: MapHandle, namespace: NamespaceId, origin: Origin },
    CreateTransientLocalMapping { connection: ConnectionRef, map: MapHandle, namespace: NamespaceId, top_level_origin: Origin, origin: Origin },
    CreateSessionMapping { connection: ConnectionRef, map: MapHandle, namespace: NamespaceId, origin: Origin },
    DestroyMapping { connection: ConnectionId, map: MapHandle },
    GetValues { connection: ConnectionRef, map: MapHandle, seed: u64 },
    SetItem { connection: ConnectionRef, map: MapHandle, source_map: MapHandle, seed: u64, key: String, value: String, url: String },
    RemoveItem { connection: ConnectionRef, map: MapHandle, source_map: MapHandle, seed: u64, key: String, url: String },
    Clear { connection: ConnectionRef, map: MapHandle, source_map: MapHandle, seed: u64, url: String },
    ImportItems { connection: ConnectionId, map: MapHandle, items: HashMap<String, String> },
    Prewarm { connection: ConnectionId, map: MapHandle },
    CreateSessionNamespace { namespace: NamespaceId, permitted: Option<ConnectionId>, quota: Option<usize> },
    DestroySessionNamespace(NamespaceId),
    SetPermittedConnection { namespace: NamespaceId, connection: Option<ConnectionRef> },
    CloneSessionNamespace { source: NamespaceId, destination: NamespaceId },
    ConnectionClosed(ConnectionId),
    DeleteOrigin(Origin),
    DeleteAll,
    DeleteLocalOriginsModifiedSince(DateTime<Utc>),
    DeleteSessionOrigin(Origin),
    DeleteAllSessionData,
    LocalOrigins(oneshot::Sender<Vec<Origin>>),
    LocalOriginDetails(oneshot::Sender<Vec<OriginDetails>>),
    SessionOrigins(oneshot::Sender<Vec<Origin>>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

pub struct StorageService {
    tx: mpsc::UnboundedSender<Task>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StorageService {
    /// Spawn the worker thread. `store` is `None` for memory-only local storage.
    pub fn start(options: StorageOptions, store: Option<Arc<dyn BackingStore>>) -> Result<Self, StorageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let manager = StorageManager::new(options.local_quota_bytes, options.session_quota_bytes, store);

        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || rt.block_on(run_worker(manager, rx)))?;

        info!(
            local_quota = options.local_quota_bytes,
            session_quota = options.session_quota_bytes,
            "storage worker started"
        );
        Ok(Self { tx, worker: Mutex::new(Some(handle)) })
    }

    pub fn create_local_mapping(&self, connection: &ConnectionRef, map: MapHandle, namespace: NamespaceId, origin: Origin) {
        self.submit(Task::CreateLocalMapping { connection: connection.clone(), map, namespace, origin });
    }

    /// Local storage for `origin` used under a different `top_level_origin`;
    /// kept per `(namespace, top_level_origin)` and never persisted.
    pub fn create_transient_local_mapping(
        &self,
        connection: &ConnectionRef,
        map: MapHandle,
        namespace: NamespaceId,
        top_level_origin: Origin,
        origin: Origin,
    ) {
        self.submit(Task::CreateTransientLocalMapping { connection: connection.clone(), map, namespace, top_level_origin, origin });
    }

    pub fn create_session_mapping(&self, connection: &ConnectionRef, map: MapHandle, namespace: NamespaceId, origin: Origin) {
        self.submit(Task::CreateSessionMapping { connection: connection.clone(), map, namespace, origin });
    }

    pub fn destroy_mapping(&self, connection: ConnectionId, map: MapHandle) {
        self.submit(Task::DestroyMapping { connection, map });
    }

    /// Reply: `DidGetValues { seed, items }` on `map`.
    pub fn get_values(&self, connection: &ConnectionRef, map: MapHandle, seed: u64) {
        self.submit(Task::GetValues { connection: connection.clone(), map, seed });
    }

    /// Reply: `DidSetItem { seed, key, quota_exceeded }` on `map`.
    #[allow(clippy::too_many_arguments)]
    pub fn set_item(
        &self,
        connection: &ConnectionRef,
        map: MapHandle,
        source_map: MapHandle,
        seed: u64,
        key: impl Into<String>,
        value: impl Into<String>,
        url: impl Into<String>,
    ) {
        self.submit(Task::SetItem {
            connection: connection.clone(),
            map,
            source_map,
            seed,
            key: key.into(),
            value: value.into(),
            url: url.into(),
        });
    }

    pub fn remove_item(
        &self,
        connection: &ConnectionRef,
        map: MapHandle,
        source_map: MapHandle,
        seed: u64,
        key: impl Into<String>,
        url: impl Into<String>,
    ) {
        self.submit(Task::RemoveItem { connection: connection.clone(), map, source_map, seed, key: key.into(), url: url.into() });
    }

    pub fn clear(&self, connection: &ConnectionRef, map: MapHandle, source_map: MapHandle, seed: u64, url: impl Into<String>) {
        self.submit(Task::Clear { connection: connection.clone(), map, source_map, seed, url: url.into() });
    }

    pub fn import_items(&self, connection: ConnectionId, map: MapHandle, items: HashMap<String, String>) {
        self.submit(Task::ImportItems { connection, map, items });
    }

    pub fn prewarm(&self, connection: ConnectionId, map: MapHandle) {
        self.submit(Task::Prewarm { connection, map });
    }

    /// `quota` falls back to the configured session quota.
    pub fn create_session_namespace(&self, namespace: NamespaceId, permitted: Option<ConnectionId>, quota: Option<usize>) {
        self.submit(Task::CreateSessionNamespace { namespace, permitted, quota });
    }

    pub fn destroy_session_namespace(&self, namespace: NamespaceId) {
        self.submit(Task::DestroySessionNamespace(namespace));
    }

    pub fn set_permitted_connection(&self, namespace: NamespaceId, connection: Option<&ConnectionRef>) {
        self.submit(Task::SetPermittedConnection { namespace, connection: connection.cloned() });
    }

    pub fn clone_session_namespace(&self, source: NamespaceId, destination: NamespaceId) {
        self.submit(Task::CloneSessionNamespace { source, destination });
    }

    pub fn connection_closed(&self, connection: ConnectionId) {
        self.submit(Task::ConnectionClosed(connection));
    }

    pub fn delete_origin(&self, origin: Origin) {
        self.submit(Task::DeleteOrigin(origin));
    }

    pub fn delete_all(&self) {
        self.submit(Task::DeleteAll);
    }

    /// Wipe local origins written at or after `since`, and all transient storage.
    pub fn delete_local_origins_modified_since(&self, since: DateTime<Utc>) {
        self.submit(Task::DeleteLocalOriginsModifiedSince(since));
    }

    pub fn delete_session_origin(&self, origin: Origin) {
        self.submit(Task::DeleteSessionOrigin(origin));
    }

    pub fn delete_all_session_data(&self) {
        self.submit(Task::DeleteAllSessionData);
    }

    pub async fn local_origins(&self) -> Result<Vec<Origin>, StorageError> {
        let (tx, rx) = oneshot::channel();
        self.try_submit(Task::LocalOrigins(tx))?;
        rx.await.map_err(|_| StorageError::WorkerStopped)
    }

    /// Creation and modification times of persisted origins; empty in memory-only mode.
    pub async fn local_origin_details(&self) -> Result<Vec<OriginDetails>, StorageError> {
        let (tx, rx) = oneshot::channel();
        self.try_submit(Task::LocalOriginDetails(tx))?;
        rx.await.map_err(|_| StorageError::WorkerStopped)
    }

    pub async fn session_origins(&self) -> Result<Vec<Origin>, StorageError> {
        let (tx, rx) = oneshot::channel();
        self.try_submit(Task::SessionOrigins(tx))?;
        rx.await.map_err(|_| StorageError::WorkerStopped)
    }

    /// Resolves once every task submitted before it has run.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        self.try_submit(Task::Flush(tx))?;
        rx.await.map_err(|_| StorageError::WorkerStopped)
    }

    /// Drain the queue, tear down every binding and namespace, and wait for
    /// the worker thread to exit. Blocks the calling thread. Concurrent
    /// callers wait for the same teardown; later calls return immediately.
    pub fn shutdown(&self) {
        // held across the join so no caller returns before the worker is gone
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = worker.take() else { return };
        if self.try_submit(Task::Shutdown).is_err() {
            debug!("storage worker already gone");
        }
        if handle.join().is_err() {
            error!("storage worker panicked");
        }
    }

    pub fn is_running(&self) -> bool { !self.tx.is_closed() }

    fn submit(&self, task: Task) {
        if let Err(e) = self.try_submit(task) {
            debug!(error = %e, "task dropped");
        }
    }

    fn try_submit(&self, task: Task) -> Result<(), StorageError> {
        enqueue(&self.tx, task, &QUEUED_TASKS)
    }
}

/// Counted before the send so the worker's decrement can never come first.
fn enqueue<T>(tx: &mpsc::UnboundedSender<T>, task: T, queued: &IntGauge) -> Result<(), StorageError> {
    queued.inc();
    if tx.send(task).is_err() {
        queued.dec();
        return Err(StorageError::WorkerStopped);
    }
    Ok(())
}

async fn run_worker(mut manager: StorageManager, mut rx: mpsc::UnboundedReceiver<Task>) {
    while let Some(task) = rx.recv().await {
        QUEUED_TASKS.dec();
        match task {
            Task::CreateLocalMapping { connection, map, namespace, origin } => {
                manager.create_local_mapping(&connection, map, namespace, origin).await
            }
            Task::CreateTransientLocalMapping { connection, map, namespace, top_level_origin, origin } => {
                manager.create_transient_local_mapping(&connection, map, namespace, top_level_origin, origin).await
            }
            Task::CreateSessionMapping { connection, map, namespace, origin } => {
                manager.create_session_mapping(&connection, map, namespace, origin).await
            }
            Task::DestroyMapping { connection, map } => manager.destroy_mapping(connection, map).await,
            Task::GetValues { connection, map, seed } => manager.read_all(&connection, map, seed).await,
            Task::SetItem { connection, map, source_map, seed, key, value, url } => {
                manager.write(&connection, map, source_map, seed, key, value, url).await
            }
            Task::RemoveItem { connection, map, source_map, seed, key, url } => {
                manager.remove(&connection, map, source_map, seed, key, url).await
            }
            Task::Clear { connection, map, source_map, seed, url } => manager.clear(&connection, map, source_map, seed, url).await,
            Task::ImportItems { connection, map, items } => manager.import_items(connection, map, items).await,
            Task::Prewarm { connection, map } => manager.prewarm(connection, map).await,
            Task::CreateSessionNamespace { namespace, permitted, quota } => {
                manager.create_session_namespace(namespace, permitted, quota)
            }
            Task::DestroySessionNamespace(namespace) => manager.destroy_session_namespace(namespace).await,
            Task::SetPermittedConnection { namespace, connection } => {
                manager.set_permitted_connection(namespace, connection.as_ref())
            }
            Task::CloneSessionNamespace { source, destination } => manager.clone_session_namespace(source, destination),
            Task::ConnectionClosed(connection) => manager.connection_closed(connection).await,
            Task::DeleteOrigin(origin) => manager.delete_origin(origin).await,
            Task::DeleteAll => manager.delete_all().await,
            Task::DeleteLocalOriginsModifiedSince(since) => manager.delete_local_origins_modified_since(since).await,
            Task::DeleteSessionOrigin(origin) => manager.delete_session_origin(origin).await,
            Task::DeleteAllSessionData => manager.delete_all_session_data().await,
            Task::LocalOrigins(reply) => {
                let _ = reply.send(manager.local_origins().await);
            }
            Task::LocalOriginDetails(reply) => {
                let _ = reply.send(manager.local_origin_details().await);
            }
            Task::SessionOrigins(reply) => {
                let _ = reply.send(manager.session_origins());
            }
            Task::Flush(reply) => {
                let _ = reply.send(());
            }
            Task::Shutdown => break,
        }
    }
    // a dropped facade ends up here as well
    rx.close();
    while rx.try_recv().is_ok() {
        QUEUED_TASKS.dec();
    }
    manager.teardown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ChannelConnection, ClientMessage, ConnectionEvent};

    #[test]
    fn shutdown_is_idempotent_and_stops_submission() {
        let service = StorageService::start(StorageOptions::default(), None).unwrap();
        assert!(service.is_running());
        service.shutdown();
        service.shutdown();
        assert!(!service.is_running());

        assert!(matches!(tokio_test::block_on(service.flush()), Err(StorageError::WorkerStopped)));
    }

    #[test]
    fn queued_gauge_counts_only_accepted_tasks() -> Result<(), anyhow::Error> {
        let queued = IntGauge::new("test_queued_tasks", "queued tasks in this test")?;
        let (tx, mut rx) = mpsc::unbounded_channel();

        enqueue(&tx, 1u8, &queued)?;
        assert_eq!(queued.get(), 1);
        assert_eq!(rx.try_recv().ok(), Some(1));

        drop(rx);
        assert!(matches!(enqueue(&tx, 2u8, &queued), Err(StorageError::WorkerStopped)));
        assert_eq!(queued.get(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn tasks_run_in_submission_order() -> Result<(), anyhow::Error> {
        let service = StorageService::start(StorageOptions::default(), None)?;
        let (conn, mut rx) = ChannelConnection::new(ConnectionId(1));
        let conn: ConnectionRef = conn;
        let origin = Origin::parse("https://example.com")?;

        service.create_local_mapping(&conn, MapHandle(1), NamespaceId(1), origin);
        for seed in 1..=3 {
            service.set_item(&conn, MapHandle(1), MapHandle(1), seed, "k", seed.to_string(), "");
        }
        service.flush().await?;

        let mut acks = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let ConnectionEvent::Message { message: ClientMessage::DidSetItem { seed, .. }, .. } = ev {
                acks.push(seed);
            }
        }
        assert_eq!(acks, vec![1, 2, 3]);

        tokio::task::spawn_blocking(move || service.shutdown()).await?;
        Ok(())
    }
}
