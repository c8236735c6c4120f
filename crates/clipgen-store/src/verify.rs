//! Integrity of rank shard files.
//!
//! Each rank file is hashed once, right after it is written, and its
//! [`ShardDescriptor`] goes into the manifest. A rank that loads its slice
//! maps the file again and checks length and BLAKE3 against that descriptor
//! before any byte reaches a model.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use clipgen_types::model::ShardDescriptor;

use crate::error::{Result, StoreError};

/// Map a file read-only.
///
/// Shard files are written under the `sharding` pod lock and never touched
/// again once `.metadata` exists; source weights are only read after their
/// download lock is released. Mapped files are therefore not modified for
/// the lifetime of the map.
pub(crate) fn map_readonly(path: &Path) -> Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: the file is immutable while mapped; see above.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

/// Hash a freshly written rank file into the descriptor the manifest keeps.
pub fn describe_shard(dir: &Path, rank: usize, file_name: &str) -> Result<ShardDescriptor> {
    let path = dir.join(file_name);
    let size_bytes = std::fs::metadata(&path)?.len();
    let blake3_hash = if size_bytes == 0 {
        // Zero-length files cannot be mapped on every platform.
        blake3::hash(&[]).to_hex().to_string()
    } else {
        blake3::hash(&map_readonly(&path)?).to_hex().to_string()
    };
    Ok(ShardDescriptor { rank, file_name: file_name.to_string(), size_bytes, blake3_hash })
}

/// Map `desc`'s file from `dir` and check it still matches the descriptor.
pub fn open_verified(dir: &Path, desc: &ShardDescriptor) -> Result<Mmap> {
    let path = dir.join(&desc.file_name);
    let on_disk = std::fs::metadata(&path)?.len();
    if on_disk != desc.size_bytes {
        return Err(StoreError::IntegrityMismatch {
            shard: desc.file_name.clone(),
            expected: format!("{} bytes", desc.size_bytes),
            actual: format!("{on_disk} bytes"),
        });
    }
    if on_disk == 0 {
        return Err(StoreError::Other(format!("rank {} shard is empty", desc.rank)));
    }

    let mapped = map_readonly(&path)?;
    let actual = blake3::hash(&mapped).to_hex().to_string();
    if !actual.eq_ignore_ascii_case(&desc.blake3_hash) {
        return Err(StoreError::IntegrityMismatch {
            shard: desc.file_name.clone(),
            expected: desc.blake3_hash.clone(),
            actual,
        });
    }
    Ok(mapped)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_rank(dir: &Path, rank: usize, bytes: &[u8]) -> ShardDescriptor {
        let name = format!("__{rank}_0.distcp");
        std::fs::write(dir.join(&name), bytes).unwrap();
        describe_shard(dir, rank, &name).unwrap()
    }

    #[test]
    fn described_shard_opens() {
        let dir = tempfile::tempdir().unwrap();
        let desc = write_rank(dir.path(), 1, &[7u8; 32]);
        assert_eq!(desc.size_bytes, 32);
        assert_eq!(desc.blake3_hash, blake3::hash(&[7u8; 32]).to_hex().to_string());

        let mapped = open_verified(dir.path(), &desc).unwrap();
        assert_eq!(&*mapped, &[7u8; 32]);
    }

    #[test]
    fn hash_case_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = write_rank(dir.path(), 0, b"rank 0 weights");
        desc.blake3_hash = desc.blake3_hash.to_uppercase();
        open_verified(dir.path(), &desc).unwrap();
    }

    #[test]
    fn rewritten_shard_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let desc = write_rank(dir.path(), 0, &[0u8; 16]);
        std::fs::write(dir.path().join(&desc.file_name), [1u8; 16]).unwrap();

        match open_verified(dir.path(), &desc).unwrap_err() {
            StoreError::IntegrityMismatch { shard, expected, .. } => {
                assert_eq!(shard, "__0_0.distcp");
                assert_eq!(expected, desc.blake3_hash);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn truncated_shard_is_rejected_by_length() {
        let dir = tempfile::tempdir().unwrap();
        let desc = write_rank(dir.path(), 2, &[3u8; 64]);
        std::fs::write(dir.path().join(&desc.file_name), [3u8; 60]).unwrap();

        let err = open_verified(dir.path(), &desc).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityMismatch { ref actual, .. } if actual == "60 bytes"));
    }

    #[test]
    fn empty_shard_describes_but_never_loads() {
        let dir = tempfile::tempdir().unwrap();
        let desc = write_rank(dir.path(), 3, b"");
        assert_eq!(desc.size_bytes, 0);
        assert_eq!(desc.blake3_hash.len(), 64);
        assert!(matches!(open_verified(dir.path(), &desc), Err(StoreError::Other(_))));
    }
}
