//! In-memory storage backend for testing.

use crate::backend::{StorageBackend, UpdateFn};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory storage backend.
///
/// Suitable for unit tests, integration tests and ephemeral sessions.
/// [`InMemoryBackend::set_available`] simulates an unreachable store so
/// callers can exercise their failure paths.
///
/// # Example
///
/// ```rust
/// use memora_storage::{InMemoryBackend, StorageBackend};
/// use serde_json::json;
///
/// let backend = InMemoryBackend::new();
/// backend.put("a", json!(1)).unwrap();
/// assert_eq!(backend.get("a").unwrap(), Some(json!(1)));
/// ```
#[derive(Debug)]
pub struct InMemoryBackend {
    documents: RwLock<BTreeMap<String, Value>>,
    available: AtomicBool,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            documents: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`StorageError::Unavailable`]
    /// (`false`) or succeed again (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns the number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("in-memory backend disabled".into()))
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        self.check_available()?;
        Ok(self.documents.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> StorageResult<()> {
        self.check_available()?;
        self.documents.write().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        self.check_available()?;
        Ok(self.documents.write().remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Value)>> {
        self.check_available()?;
        Ok(self
            .documents
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> StorageResult<Value> {
        self.check_available()?;
        let mut documents = self.documents.write();
        let next = f(documents.get(key).cloned())?;
        documents.insert(key.to_string(), next.clone());
        Ok(next)
    }

    fn flush(&self) -> StorageResult<()> {
        self.check_available()
    }
}
