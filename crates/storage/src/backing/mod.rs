//! Backing store abstractions for persistent (local) storage.
//!
//! The service never touches files directly; a [`BackingStore`] hands out one
//! [`OriginDatabase`] per origin, opened lazily on first use.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StorageError;
use crate::types::Origin;

pub mod json_file;
pub mod memory;

pub use json_file::JsonFileBackingStore;
pub use memory::MemoryBackingStore;

/// What the store knows about one origin's database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginDetails {
    pub origin: Origin,
    pub creation_time: Option<DateTime<Utc>>,
    pub modification_time: Option<DateTime<Utc>>,
}

/// Per-origin database handle. Only ever used from the storage worker.
#[async_trait]
pub trait OriginDatabase: Send {
    /// Read everything currently stored for the origin.
    async fn import_items(&mut self) -> Result<HashMap<String, String>, StorageError>;
    async fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn remove_item(&mut self, key: &str) -> Result<(), StorageError>;
    async fn clear(&mut self) -> Result<(), StorageError>;
    async fn close(&mut self) -> Result<(), StorageError>;
}

/// Trait abstraction for the on-disk side of local storage.
/// Implementations can be file-backed, database-backed, or in-memory.
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn open(&self, origin: &Origin) -> Result<Box<dyn OriginDatabase>, StorageError>;
    async fn delete_origin(&self, origin: &Origin) -> Result<(), StorageError>;
    async fn delete_all(&self) -> Result<(), StorageError>;
    /// Origins that currently have persisted data.
    async fn origins(&self) -> Result<Vec<Origin>, StorageError>;
    /// Timestamps for every persisted origin, sorted by origin.
    async fn origin_details(&self) -> Result<Vec<OriginDetails>, StorageError>;
}
