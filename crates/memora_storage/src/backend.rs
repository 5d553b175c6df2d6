//! Storage backend trait definition.

use crate::error::StorageResult;
use serde_json::Value;
use std::sync::Arc;

/// Closure applied by [`StorageBackend::update`].
///
/// Receives the current document (if any) and returns the document to store.
pub type UpdateFn<'a> = dyn FnMut(Option<Value>) -> StorageResult<Value> + 'a;

/// A durable key-value store of JSON documents.
///
/// # Invariants
///
/// - `get` returns exactly the document last written under that key
/// - `update` is atomic: no other write to the key interleaves between
///   reading the current document and storing the result
/// - A failed write leaves the previous document in place
/// - Backends must be `Send + Sync` and use interior locking
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads the document stored under `key`.
    fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Stores `value` under `key`, replacing any previous document.
    fn put(&self, key: &str, value: Value) -> StorageResult<()>;

    /// Removes `key`. Returns true if it existed.
    fn remove(&self, key: &str) -> StorageResult<bool>;

    /// Returns all documents whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Value)>>;

    /// Atomically replaces the document under `key` with `f(current)`.
    ///
    /// If `f` fails nothing is written. Returns the stored document.
    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> StorageResult<Value>;

    /// Ensures all writes are durable.
    fn flush(&self) -> StorageResult<()>;
}

impl<B: StorageBackend + ?Sized> StorageBackend for Arc<B> {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: Value) -> StorageResult<()> {
        (**self).put(key, value)
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        (**self).remove(key)
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Value)>> {
        (**self).scan_prefix(prefix)
    }

    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> StorageResult<Value> {
        (**self).update(key, f)
    }

    fn flush(&self) -> StorageResult<()> {
        (**self).flush()
    }
}
