//! Content checksums for synced records.
//!
//! Checksums are SHA-256 digests of the canonical JSON encoding: values are
//! converted to [`serde_json::Value`] first so object keys are sorted.

use crate::error::ProtocolResult;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Computes the hex checksum of any serializable value.
pub fn checksum_of<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<String> {
    let value = serde_json::to_value(value)?;
    checksum_value(&value)
}

/// Computes the hex checksum of a JSON value.
pub fn checksum_value(value: &serde_json::Value) -> ProtocolResult<String> {
    let bytes = serde_json::to_vec(value)?;
    let digest = Sha256::digest(&bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}
