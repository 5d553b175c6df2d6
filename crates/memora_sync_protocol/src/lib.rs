//! # Memora Sync Protocol
//!
//! Sync protocol types for Memora.
//!
//! This crate provides:
//! - [`SyncableEntity`] and [`SyncMeta`] for versioned, checksummed records
//! - [`ProgressRecord`], the synced per-card progress entity
//! - [`SyncOperation`] for queued mutations
//! - [`SyncConflict`] and [`ConflictResolver`] for conflict handling
//! - Wire messages for the remote progress service and its HTTP contract
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checksum;
mod conflict;
mod entity;
mod error;
pub mod http;
mod messages;
mod operation;

pub use checksum::{checksum_of, checksum_value};
pub use conflict::{
    ConflictResolver, ConflictType, EntitySnapshot, Resolution, SyncConflict,
    DEFAULT_CONCURRENT_WINDOW_SECS,
};
pub use entity::{ProgressRecord, SyncMeta, SyncStatus, SyncableEntity};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ConflictBody, ConflictResponse, ProgressAccepted, ProgressRequest, RemoteReply, RequestMeta,
    StatsDelta, StudySession, CLIENT_VERSION,
};
pub use operation::{EntityType, OperationType, Priority, SyncOperation};
