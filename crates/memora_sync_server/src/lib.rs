//! # Memora Sync Server
//!
//! Reference implementation of the remote progress service.
//!
//! This crate provides:
//! - `POST /progress` and `GET /progress` with version-based conflict detection
//! - `POST /stats`, merging daily deltas per (user, date)
//! - `POST /sessions`, storing sealed study sessions once
//! - Replay protection keyed by `X-Operation-ID`
//!
//! # Architecture
//!
//! The server speaks the plain request/response values from
//! [`memora_sync_protocol::http`], so it can sit behind any HTTP front end or
//! be called in-process by the client's loopback transport. State lives in a
//! [`ServerStore`] shared by every request.
//!
//! # Version Rules
//!
//! For a progress write carrying client version `cv` against stored version `sv`:
//! 1. `cv > sv`, or no stored row: accepted, stored at version `cv`
//! 2. `cv == sv` with the same checksum: accepted again, nothing changes
//! 3. `cv == sv` with a different checksum: `409`, type `data`
//! 4. `cv < sv`: `409`, type `concurrent` when both edits fall inside the
//!    concurrent window, `version` otherwise
//!
//! A write without a client state or version is scheduled by the server
//! from the grade and stored at `sv + 1`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;
mod store;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::SyncServer;
pub use store::{ProgressWrite, ServerStore};
