//! Shard manifest CBOR serialization and JSON export.
//!
//! A [`ShardManifest`] is the `.metadata` file of a sharded checkpoint: it
//! lists every rank's file, size, and BLAKE3 hash. It is written last, so its
//! presence marks the rank files as finished.

use std::path::Path;

use clipgen_types::model::ShardManifest;

use crate::error::{Result, StoreError};

/// Serialize a manifest to CBOR and write it to `path`.
pub fn write_manifest(manifest: &ShardManifest, path: &Path) -> Result<()> {
    let mut buf: Vec<u8> = Vec::new();
    ciborium::ser::into_writer(manifest, &mut buf)
        .map_err(|e| StoreError::Other(format!("CBOR serialization: {e}")))?;
    std::fs::write(path, &buf)?;
    Ok(())
}

/// Read a manifest from a CBOR file.
pub fn read_manifest(path: &Path) -> Result<ShardManifest> {
    let data = std::fs::read(path)?;
    ciborium::de::from_reader(&data[..])
        .map_err(|e| StoreError::Other(format!("CBOR deserialization: {e}")))
}

/// Pretty-print a manifest as JSON (useful for debugging / inspection).
pub fn manifest_to_json(manifest: &ShardManifest) -> Result<String> {
    serde_json::to_string_pretty(manifest)
        .map_err(|e| StoreError::Other(format!("JSON serialization: {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
