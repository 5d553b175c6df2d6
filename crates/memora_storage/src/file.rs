//! File-based storage backend for persistent storage.

use crate::backend::{StorageBackend, UpdateFn};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A file-based storage backend.
///
/// All documents live in one JSON object on disk. Every write serializes the
/// whole map to a sibling temporary file, syncs it and renames it over the
/// original, so a crash never leaves a half-written store behind.
///
/// # Durability
///
/// Each successful `put`, `remove` and `update` is durable on return.
/// A write that fails leaves both the file and the in-memory view unchanged.
///
/// # Example
///
/// ```no_run
/// use memora_storage::{FileBackend, StorageBackend};
/// use serde_json::json;
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("memora.json")).unwrap();
/// backend.put("device/id", json!("3f1c")).unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    documents: RwLock<BTreeMap<String, Value>>,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if the file exists but is not a
    /// JSON object, or an I/O error if it cannot be read.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let documents = match fs::read(path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::Corrupted(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %path.display(), documents = documents.len(), "opened store");

        Ok(Self {
            path: path.to_path_buf(),
            documents: RwLock::new(documents),
        })
    }

    /// Opens or creates a file backend, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot be read.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn persist(&self, documents: &BTreeMap<String, Value>) -> StorageResult<()> {
        let bytes = serde_json::to_vec(documents)?;
        let temp = self.temp_path();
        {
            let mut file = File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    /// Applies `mutate` to a copy of the map, persists it, then swaps it in.
    fn write_with<T>(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, Value>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut documents = self.documents.write();
        let mut next = documents.clone();
        let out = mutate(&mut next)?;
        self.persist(&next)?;
        *documents = next;
        Ok(out)
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.documents.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> StorageResult<()> {
        self.write_with(|documents| {
            documents.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        if !self.documents.read().contains_key(key) {
            return Ok(false);
        }
        self.write_with(|documents| Ok(documents.remove(key).is_some()))
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Value)>> {
        Ok(self
            .documents
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> StorageResult<Value> {
        self.write_with(|documents| {
            let next = f(documents.get(key).cloned())?;
            documents.insert(key.to_string(), next.clone());
            Ok(next)
        })
    }

    fn flush(&self) -> StorageResult<()> {
        let documents = self.documents.read();
        self.persist(&documents)
    }
}
