//! Origin-scoped key/value storage service shared by many client connections.
//! - Local (persistent), transient (partitioned) and session (ephemeral)
//!   namespaces, one map per origin.
//! - Hard per-origin byte quota; rejected writes leave no trace.
//! - Change events fanned out to every binding on the same map.
//! - All state confined to one worker thread; see [`service::StorageService`].

pub mod errors;
pub mod types;
pub mod storage_map;
pub mod connection;
pub mod backing;
pub mod area;
pub mod arena;
pub mod binding;
pub mod local_namespace;
pub mod session_namespace;
pub mod transient_namespace;
pub mod manager;
pub mod observability;
pub mod service;

pub use backing::{BackingStore, JsonFileBackingStore, MemoryBackingStore, OriginDatabase, OriginDetails};
pub use connection::{ChannelConnection, ClientMessage, Connection, ConnectionEvent, ConnectionRef, StorageEvent};
pub use errors::{QuotaExceeded, StorageError};
pub use service::{StorageOptions, StorageService};
pub use storage_map::{StorageMap, DEFAULT_QUOTA_BYTES};
pub use types::{Binding, ConnectionId, MapHandle, NamespaceId, Origin};
