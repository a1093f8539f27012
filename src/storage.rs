//! Blob storage for uploaded originals and generated previews.
//!
//! The [`StorageSink`] owns key generation (`{prefix}{uuid}{extension}`) and
//! delegates the byte transport to a [`BlobStore`] backend. Keys are random, so
//! concurrent uploads never coordinate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_KEY_PREFIX: &str = "hidoc2/images/";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload of {key} failed: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upload of {key} rejected: {reason}")]
    Rejected { key: String, reason: String },

    #[error("invalid storage key {0:?}")]
    InvalidKey(String),
}

/// Transport to a key-value object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`. Keys are never reused, so no overwrite
    /// semantics are required.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`; a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Stores objects as files below a root directory, one file per key.
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let escapes = relative.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_))
        });
        if key.is_empty() || escapes {
            return Err(StorageError::InvalidKey(key.to_owned()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let io_error = |source| StorageError::Io {
            key: key.to_owned(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        // Staged next to the final path; dropping the staging handle before
        // `persist` deletes the file, so a cancelled put leaves nothing behind.
        let parent = path.parent().unwrap_or(&self.root);
        let (file, staging) = NamedTempFile::new_in(parent).map_err(io_error)?.into_parts();
        let mut file = fs::File::from_std(file);
        file.write_all(bytes).await.map_err(io_error)?;
        file.sync_all().await.map_err(io_error)?;
        drop(file);
        // No await between here and return: the rename is never abandoned midway.
        staging.persist(&path).map_err(|e| io_error(e.error))?;

        debug!(%key, size = bytes.len(), "blob written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }
}

/// Process-local store, for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Arc<[u8]>>>,
    puts: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `put` calls received, successful or not.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<[u8]>>> {
        // A panicked writer cannot leave a half-inserted entry behind.
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(key.to_owned(), Arc::from(bytes));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// Generates globally unique object keys.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    prefix: String,
}

impl KeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// `extension` includes its leading dot, or is empty.
    pub fn generate(&self, extension: &str) -> String {
        format!("{}{}{}", self.prefix, Uuid::new_v4(), extension)
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub size_bytes: u64,
}

#[derive(Clone)]
pub struct StorageSink {
    store: Arc<dyn BlobStore>,
    keys: KeyGenerator,
}

impl StorageSink {
    pub fn new(store: Arc<dyn BlobStore>, keys: KeyGenerator) -> Self {
        Self { store, keys }
    }

    pub fn allocate_key(&self, extension: &str) -> String {
        self.keys.generate(extension)
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<StoredBlob, StorageError> {
        self.store.put(key, bytes).await?;
        Ok(StoredBlob {
            key: key.to_owned(),
            size_bytes: bytes.len() as u64,
        })
    }

    pub async fn store(&self, bytes: &[u8], extension: &str) -> Result<StoredBlob, StorageError> {
        let key = self.allocate_key(extension);
        self.put(&key, bytes).await
    }

    /// Best-effort removal of objects written for a request that did not
    /// commit. Leftovers are tolerated: the record store decides what exists.
    pub async fn discard(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.store.delete(key).await {
                warn!(%key, error = %e, "could not remove uncommitted blob");
            }
        }
    }
}

/// Builds publicly servable URLs from storage keys.
#[derive(Debug, Clone)]
pub struct PublicUrls {
    base: String,
}

impl PublicUrls {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_owned(),
        }
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base, key)
    }
}
