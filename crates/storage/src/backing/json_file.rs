use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::debug;

use super::{BackingStore, OriginDatabase, OriginDetails};
use crate::errors::StorageError;
use crate::types::Origin;

const FILE_SUFFIX: &str = ".localstorage.json";

/// JSON file-backed local storage: one file per origin under `root`.
///
/// Each mutation rewrites the origin's file. Intended for the small maps web
/// storage holds; an origin is capped by its quota anyway.
#[derive(Debug, Clone)]
pub struct JsonFileBackingStore {
    root: PathBuf,
}

impl JsonFileBackingStore {
    /// Initialize the store under `root`, creating the directory if missing.
    pub async fn new<P: Into<PathBuf>>(root: P) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &std::path::Path { &self.root }

    fn path_for(&self, origin: &Origin) -> PathBuf {
        self.root.join(format!("{}{}", origin.database_identifier(), FILE_SUFFIX))
    }
}

#[async_trait]
impl BackingStore for JsonFileBackingStore {
    async fn open(&self, origin: &Origin) -> Result<Box<dyn OriginDatabase>, StorageError> {
        Ok(Box::new(JsonOriginDatabase { file_path: self.path_for(origin), items: HashMap::new() }))
    }

    async fn delete_origin(&self, origin: &Origin) -> Result<(), StorageError> {
        remove_if_exists(&self.path_for(origin)).await
    }

    async fn delete_all(&self) -> Result<(), StorageError> {
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(FILE_SUFFIX) {
                remove_if_exists(&entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn origins(&self) -> Result<Vec<Origin>, StorageError> {
        let mut origins = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(origin) = name.strip_suffix(FILE_SUFFIX).and_then(Origin::from_database_identifier) {
                origins.push(origin);
            }
        }
        origins.sort();
        Ok(origins)
    }

    async fn origin_details(&self) -> Result<Vec<OriginDetails>, StorageError> {
        let mut details = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(origin) = name.strip_suffix(FILE_SUFFIX).and_then(Origin::from_database_identifier) else {
                continue;
            };
            let meta = entry.metadata().await?;
            // creation time is not available on every file system
            details.push(OriginDetails {
                origin,
                creation_time: meta.created().ok().map(DateTime::<Utc>::from),
                modification_time: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        details.sort_by(|a, b| a.origin.cmp(&b.origin));
        Ok(details)
    }
}

async fn remove_if_exists(path: &std::path::Path) -> Result<(), StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// One origin's file. Keeps the last written map so writes can persist the whole file.
struct JsonOriginDatabase {
    file_path: PathBuf,
    items: HashMap<String, String>,
}

impl JsonOriginDatabase {
    async fn save(&self) -> Result<(), StorageError> {
        let data = serde_json::to_vec(&self.items)?;
        fs::write(&self.file_path, data).await?;
        Ok(())
    }
}

#[async_trait]
impl OriginDatabase for JsonOriginDatabase {
    async fn import_items(&mut self) -> Result<HashMap<String, String>, StorageError> {
        self.items = match fs::read(&self.file_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %self.file_path.display(), count = self.items.len(), "imported local storage file");
        Ok(self.items.clone())
    }

    async fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items.insert(key.to_string(), value.to_string());
        self.save().await
    }

    async fn remove_item(&mut self, key: &str) -> Result<(), StorageError> {
        if self.items.remove(key).is_some() {
            self.save().await?;
        }
        Ok(())
    }

    async fn clear(&mut self) -> Result<(), StorageError> {
        self.items.clear();
        self.save().await
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        // nothing worth keeping
        if self.items.is_empty() {
            remove_if_exists(&self.file_path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn json_backing_store_persists_per_origin() -> Result<(), anyhow::Error> {
        let tmp = std::env::temp_dir().join(format!("json_backing_store_{}", Uuid::new_v4()));
        let store = JsonFileBackingStore::new(&tmp).await?;
        let origin = Origin::parse("https://example.com")?;
        let before = Utc::now() - chrono::Duration::minutes(1);

        // initially empty
        let mut db = store.open(&origin).await?;
        assert!(db.import_items().await?.is_empty());
        assert!(store.origins().await?.is_empty());

        // write through and reopen
        db.set_item("a", "1").await?;
        db.set_item("b", "2").await?;
        db.remove_item("b").await?;
        db.close().await?;

        let mut reopened = store.open(&origin).await?;
        let items = reopened.import_items().await?;
        assert_eq!(items.len(), 1);
        assert_eq!(items.get("a").map(String::as_str), Some("1"));
        assert_eq!(store.origins().await?, vec![origin.clone()]);

        let details = store.origin_details().await?;
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].origin, origin);
        assert!(details[0].modification_time.is_some_and(|t| t > before));

        // cleared databases disappear on close
        reopened.clear().await?;
        reopened.close().await?;
        assert!(store.origins().await?.is_empty());

        let _ = tokio::fs::remove_dir_all(&tmp).await;
        Ok(())
    }

    #[tokio::test]
    async fn delete_all_only_touches_storage_files() -> Result<(), anyhow::Error> {
        let tmp = std::env::temp_dir().join(format!("json_backing_store_{}", Uuid::new_v4()));
        let store = JsonFileBackingStore::new(&tmp).await?;
        tokio::fs::write(tmp.join("unrelated.txt"), b"keep").await?;

        for host in ["a.test", "b.test"] {
            let mut db = store.open(&Origin::new("https", host, None)).await?;
            db.import_items().await?;
            db.set_item("k", "v").await?;
        }
        assert_eq!(store.origins().await?.len(), 2);

        store.delete_origin(&Origin::new("https", "a.test", None)).await?;
        assert_eq!(store.origins().await?, vec![Origin::new("https", "b.test", None)]);

        store.delete_all().await?;
        assert!(store.origins().await?.is_empty());
        assert!(tokio::fs::metadata(tmp.join("unrelated.txt")).await.is_ok());

        let _ = tokio::fs::remove_dir_all(&tmp).await;
        Ok(())
    }
}
