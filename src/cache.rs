use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::sync::{Arc, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::MirrorError;

/// Key-value storage behind a [`QueryCache`].
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, MirrorError>;
    fn insert(&self, key: &str, value: &Value) -> Result<(), MirrorError>;
    fn remove(&self, key: &str) -> Result<(), MirrorError>;
    fn clear(&self) -> Result<(), MirrorError>;
}

/// Fetch-or-compute cache over raw query results.
///
/// Failed computations are never stored. Concurrent misses on one key may
/// compute twice; the last insert wins.
#[derive(Clone)]
pub struct QueryCache {
    backend: Arc<dyn CacheBackend>,
}

impl QueryCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::default()))
    }

    pub fn fetch_or_compute<F>(&self, key: &str, compute: F) -> Result<Value, MirrorError>
    where
        F: FnOnce() -> Result<Value, MirrorError>,
    {
        match self.backend.get(key) {
            Ok(Some(value)) => {
                tracing::debug!(key, "query cache hit");
                return Ok(value);
            }
            Ok(None) => tracing::debug!(key, "query cache miss"),
            Err(err) => tracing::warn!(key, error = %err, "query cache read failed"),
        }

        let value = compute()?;
        if let Err(err) = self.backend.insert(key, &value) {
            tracing::warn!(key, error = %err, "query cache write failed");
        }
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) -> Result<(), MirrorError> {
        tracing::debug!(key, "query cache invalidate");
        self.backend.remove(key)
    }

    pub fn invalidate_all(&self) -> Result<(), MirrorError> {
        tracing::debug!("query cache cleared");
        self.backend.clear()
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Value>, MirrorError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| MirrorError::Filesystem("query cache lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn insert(&self, key: &str, value: &Value) -> Result<(), MirrorError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MirrorError::Filesystem("query cache lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), MirrorError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MirrorError::Filesystem("query cache lock poisoned".to_string()))?;
        entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), MirrorError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MirrorError::Filesystem("query cache lock poisoned".to_string()))?;
        entries.clear();
        Ok(())
    }
}

/// One JSON file per key under a cache directory.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: Utf8PathBuf,
}

impl DiskCache {
    pub fn new() -> Result<Self, MirrorError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.home_dir()
                        .join(".cache")
                        .join("openbis-mirror")
                        .join("queries"),
                )
                .ok()
            })
            .ok_or_else(|| {
                MirrorError::Filesystem("unable to resolve cache directory".to_string())
            })?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> Utf8PathBuf {
        let file_name: String = key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{file_name}.json"))
    }
}

impl CacheBackend for DiskCache {
    fn get(&self, key: &str) -> Result<Option<Value>, MirrorError> {
        let path = self.entry_path(key);
        let content = match fs::read(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(MirrorError::Filesystem(err.to_string())),
        };
        let value =
            serde_json::from_slice(&content).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        Ok(Some(value))
    }

    fn insert(&self, key: &str, value: &Value) -> Result<(), MirrorError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        let content =
            serde_json::to_vec(value).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("openbis-mirror-cache")
            .tempfile_in(self.root.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        temp.persist(self.entry_path(key).as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), MirrorError> {
        match fs::remove_file(self.entry_path(key).as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MirrorError::Filesystem(err.to_string())),
        }
    }

    fn clear(&self) -> Result<(), MirrorError> {
        if self.root.as_std_path().exists() {
            fs::remove_dir_all(self.root.as_std_path())
                .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }
}

/// Hex SHA-256 of an identifier, used to bound key length and keep raw ids
/// out of shared key namespaces.
pub fn digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}
