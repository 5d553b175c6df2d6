//! # Memora Storage
//!
//! Durable per-device persistence for Memora.
//!
//! Backends are **JSON document stores** keyed by string. They know nothing
//! about cards or sync; [`ProgressStore`] owns the record layout on top.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral sessions
//! - [`FileBackend`] - A single JSON file, replaced atomically on each write
//!
//! ## Example
//!
//! ```rust
//! use memora_storage::{InMemoryBackend, StorageBackend};
//! use serde_json::json;
//!
//! let backend = InMemoryBackend::new();
//! backend.put("settings", json!({"graduatingInterval": 1})).unwrap();
//! assert!(backend.get("settings").unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod device;
mod error;
mod file;
mod memory;
mod progress;

pub use backend::{StorageBackend, UpdateFn};
pub use device::DeviceIdentity;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use progress::{CommitOutcome, ProgressStore};
