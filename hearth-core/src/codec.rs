//! Blob encodings for persisted state.
//!
//! Two framings share one LZ4 envelope:
//! ```text
//! ┌───────────────┬─────────────────────────────────────┐
//! │ size (u32 LE) │ LZ4 block( bincode | JSON payload ) │
//! └───────────────┴─────────────────────────────────────┘
//! ```
//!
//! Folder trees and keystore bags use the binary framing. Scenes carry
//! free-form JSON key data, which bincode cannot describe, so they use the
//! JSON framing.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Encode a value as LZ4-compressed bincode.
pub fn pack<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| Error::Codec(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

/// Decode a value produced by [`pack`].
pub fn unpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let raw = lz4_flex::decompress_size_prepended(bytes).map_err(|e| Error::Codec(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| Error::Codec(e.to_string()))?;
    Ok(value)
}

/// Encode a value as LZ4-compressed JSON.
pub fn pack_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let raw = serde_json::to_vec(value).map_err(|e| Error::Codec(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

/// Decode a value produced by [`pack_json`].
pub fn unpack_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let raw = lz4_flex::decompress_size_prepended(bytes).map_err(|e| Error::Codec(e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| Error::Codec(e.to_string()))
}
