//! Durable key-value blob stores backing the session store

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Synchronous store of whole string blobs addressed by key
pub trait BlobStore: Send + Sync {
    /// Read a blob, `None` when the key was never written
    fn get(&self, key: &str) -> crate::Result<Option<String>>;

    /// Replace the blob stored under `key`
    fn put(&self, key: &str, value: &str) -> crate::Result<()>;
}

/// Blob store keeping one file per key in a directory
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let safe_key: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{}.json", safe_key))
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> crate::Result<Option<String>> {
        let path = self.blob_path(key);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(crate::Error::Storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn put(&self, key: &str, value: &str) -> crate::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.blob_path(key);
        let tmp = path.with_extension("json.tmp");

        // Whole-blob replace: readers see the old or the new file, never half.
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            crate::Error::Storage(format!("failed to replace {}: {}", path.display(), e))
        })?;
        debug!(key, bytes = value.len(), "blob written");
        Ok(())
    }
}

/// In-memory blob store; clones share the same contents
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob directly, bypassing any store logic
    pub fn with_blob(key: &str, value: impl Into<String>) -> Self {
        let store = Self::new();
        store.blobs.lock().insert(key.to_string(), value.into());
        store
    }

    /// Raw contents under `key`
    pub fn raw(&self, key: &str) -> Option<String> {
        self.blobs.lock().get(key).cloned()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> crate::Result<Option<String>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> crate::Result<()> {
        self.blobs.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
