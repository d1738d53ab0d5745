//! # Payload Codec
//!
//! Helpers shared by the write and read paths:
//!
//! - Payload checksums (XXH3-64, verified on every read)
//! - Commit metadata encoding
//! - The [`Serializer`] seam between stored bytes and typed events
//!
//! ## Serializer
//!
//! Stored payloads are opaque bytes. A [`Serializer`] turns them into a
//! `serde_json::Value`, and the contract registry turns that value into the
//! concrete event type. [`JsonSerializer`] is the default; swap it for another
//! byte format without touching contract types.
//!
//! ```text
//! payload bytes ──Serializer──► serde_json::Value ──ContractRegistry──► Box<dyn Event>
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::types::Metadata;

// =============================================================================
// Checksums
// =============================================================================

/// Length of a stored checksum in bytes.
pub const CHECKSUM_LEN: usize = 8;

/// Computes the checksum stored alongside an event payload.
pub fn compute_checksum(data: &[u8]) -> Vec<u8> {
    let hash = xxhash_rust::xxh3::xxh3_64(data);
    hash.to_le_bytes().to_vec()
}

/// Verifies a payload against its stored checksum.
///
/// `what` names the row in the error message.
pub fn verify_checksum(data: &[u8], stored: &[u8], what: impl FnOnce() -> String) -> Result<()> {
    if stored.len() != CHECKSUM_LEN || compute_checksum(data) != stored {
        return Err(Error::Corruption(format!("checksum mismatch for {}", what())));
    }
    Ok(())
}

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Metadata
// =============================================================================

/// Encodes commit metadata. Empty metadata is stored as NULL.
pub fn encode_metadata(metadata: &Metadata) -> Result<Option<Vec<u8>>> {
    if metadata.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_vec(metadata)?))
}

/// Decodes commit metadata. NULL decodes to empty metadata.
pub fn decode_metadata(blob: Option<&[u8]>) -> Result<Metadata> {
    match blob {
        None => Ok(Metadata::new()),
        Some(bytes) => Ok(serde_json::from_slice(bytes)?),
    }
}

// =============================================================================
// Serializer
// =============================================================================

/// Converts between stored payload bytes and a structured value.
///
/// Failures in either direction surface as [`Error::Serialization`].
pub trait Serializer: Send + Sync {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// Stores payloads as UTF-8 JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// =============================================================================
// Tests
// =============================================================================
