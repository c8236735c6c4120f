//! Sharded checkpoints.
//!
//! Layout inside the shard directory:
//!
//! ```text
//! <shards_dir>/
//!   .metadata          CBOR ShardManifest, written last
//!   __0_0.distcp       rank 0's slice
//!   __1_0.distcp       rank 1's slice
//!   ...
//!   .sharding.lock     present only while a process is creating the artifact
//! ```
//!
//! The artifact is complete iff `.metadata` and every rank file exist. A
//! partial set is never loaded: any failure during creation removes the
//! directory wholesale before the error is returned.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{info, warn};

use clipgen_types::config::CoordinatorConfig;
use clipgen_types::model::{ModelComponent, ShardManifest};
use clipgen_types::tensor::split_sizes;

use crate::coordinator::{self, CoordinationOutcome, PodWork};
use crate::error::{Result, StoreError};
use crate::manifest;
use crate::verify;

pub const METADATA_FILE: &str = ".metadata";
pub const SHARDING_LOCK: &str = "sharding";

/// File name of `rank`'s slice.
pub fn rank_file_name(rank: usize) -> String {
    format!("__{rank}_0.distcp")
}

// ── Writers ───────────────────────────────────────────────────────────────────

/// Produces the bytes of each rank's slice of a checkpoint.
pub trait ShardWriter: Send + Sync {
    fn component(&self) -> ModelComponent;

    /// Write `rank`'s slice (out of `world_size`) to `out`.
    fn write_rank(&self, rank: usize, world_size: usize, out: &mut dyn Write) -> anyhow::Result<()>;
}

/// Splits a single weight file into contiguous byte ranges, one per rank.
/// Earlier ranks take one extra byte when the size does not divide evenly.
pub struct ByteRangeShardWriter {
    source: PathBuf,
    component: ModelComponent,
}

impl ByteRangeShardWriter {
    pub fn new(source: impl Into<PathBuf>, component: ModelComponent) -> Self {
        Self { source: source.into(), component }
    }
}

impl ShardWriter for ByteRangeShardWriter {
    fn component(&self) -> ModelComponent {
        self.component
    }

    fn write_rank(&self, rank: usize, world_size: usize, out: &mut dyn Write) -> anyhow::Result<()> {
        let len = fs::metadata(&self.source)?.len() as usize;
        let sizes = split_sizes(len, world_size);
        let start: usize = sizes[..rank].iter().sum();
        let size = sizes
            .get(rank)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("rank {rank} out of range for world size {world_size}"))?;
        if size == 0 {
            return Ok(());
        }
        let mapped = verify::map_readonly(&self.source)?;
        out.write_all(&mapped[start..start + size])?;
        Ok(())
    }
}

// ── Artifact ──────────────────────────────────────────────────────────────────

/// A sharded checkpoint directory for a fixed world size.
#[derive(Debug, Clone)]
pub struct ShardArtifact {
    dir: PathBuf,
    world_size: usize,
}

impl ShardArtifact {
    pub fn new(dir: impl Into<PathBuf>, world_size: usize) -> Self {
        Self { dir: dir.into(), world_size }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn rank_path(&self, rank: usize) -> PathBuf {
        self.dir.join(rank_file_name(rank))
    }

    /// Metadata and every rank file exist. Pure; safe to call from any
    /// number of processes at once.
    pub fn is_complete(&self) -> bool {
        self.metadata_path().exists()
            && (0..self.world_size).all(|rank| self.rank_path(rank).exists())
    }

    /// Write every rank file, then the manifest. On any failure the whole
    /// directory is removed and [`StoreError::PartialArtifact`] is returned.
    pub fn create(&self, writer: &dyn ShardWriter) -> Result<ShardManifest> {
        info!(
            dir = %self.dir.display(),
            world_size = self.world_size,
            component = %writer.component(),
            "creating sharded checkpoint"
        );

        match self.try_create(writer) {
            Ok(manifest) => {
                info!(dir = %self.dir.display(), "sharded checkpoint complete");
                Ok(manifest)
            }
            Err(e) => {
                let reason = e.to_string();
                self.remove_all();
                Err(StoreError::PartialArtifact { dir: self.dir.clone(), reason })
            }
        }
    }

    fn try_create(&self, writer: &dyn ShardWriter) -> Result<ShardManifest> {
        if self.world_size == 0 {
            return Err(StoreError::Other("world size must be at least 1".into()));
        }
        fs::create_dir_all(&self.dir)?;

        let mut shards = Vec::with_capacity(self.world_size);
        for rank in 0..self.world_size {
            let path = self.rank_path(rank);
            let mut out = BufWriter::new(File::create(&path)?);
            writer
                .write_rank(rank, self.world_size, &mut out)
                .map_err(|e| StoreError::Other(format!("rank {rank}: {e:#}")))?;
            out.flush()?;
            out.get_ref().sync_all()?;

            let desc = verify::describe_shard(&self.dir, rank, &rank_file_name(rank))?;
            info!(rank, size_bytes = desc.size_bytes, "rank shard written");
            shards.push(desc);
        }

        let man = ShardManifest {
            world_size: self.world_size,
            component: writer.component(),
            shards,
            created_at: chrono::Utc::now(),
        };
        manifest::write_manifest(&man, &self.metadata_path())?;

        if !self.is_complete() {
            return Err(StoreError::NotFound(format!(
                "checkpoint metadata missing after write: {}",
                self.metadata_path().display()
            )));
        }
        Ok(man)
    }

    fn remove_all(&self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => warn!(dir = %self.dir.display(), "removed partial checkpoint"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "failed to remove partial checkpoint"),
        }
    }

    /// Create the artifact under the `sharding` pod lock unless it is
    /// already complete.
    pub async fn ensure(
        &self,
        writer: &dyn ShardWriter,
        config: &CoordinatorConfig,
    ) -> Result<CoordinationOutcome> {
        let work = PodWork::new(&self.dir, SHARDING_LOCK)
            .description(format!("{} sharding", writer.component()))
            .max_wait(config.sharding_max_wait)
            .poll_interval(config.poll_interval);

        coordinator::coordinate_with_retry(
            &work,
            config.max_attempts,
            || self.is_complete(),
            move || async move { self.create(writer).map(|_| ()) },
        )
        .await
    }

    /// Read the manifest of a complete artifact.
    pub fn manifest(&self) -> Result<ShardManifest> {
        if !self.is_complete() {
            return Err(StoreError::NotFound(format!(
                "no complete checkpoint in {}",
                self.dir.display()
            )));
        }
        manifest::read_manifest(&self.metadata_path())
    }

    /// Memory-map `rank`'s slice after checking it against the manifest.
    pub fn load_rank(&self, rank: usize) -> Result<Mmap> {
        let man = self.manifest()?;
        if man.world_size != self.world_size {
            return Err(StoreError::Other(format!(
                "checkpoint was sharded for world size {}, expected {}",
                man.world_size, self.world_size
            )));
        }
        let desc = man
            .shard(rank)
            .ok_or_else(|| StoreError::NotFound(rank_file_name(rank)))?;

        verify::open_verified(&self.dir, desc)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Writes `rank` repeated 16 times, failing at `fail_at` if set.
    struct PatternWriter {
        fail_at: Option<usize>,
    }

    impl ShardWriter for PatternWriter {
        fn component(&self) -> ModelComponent {
            ModelComponent::Denoiser
        }

        fn write_rank(&self, rank: usize, _world: usize, out: &mut dyn Write) -> anyhow::Result<()> {
            if self.fail_at == Some(rank) {
                anyhow::bail!("device lost while saving rank {rank}");
            }
            out.write_all(&[rank as u8; 16])?;
            Ok(())
        }
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            poll_interval: Duration::from_millis(10),
            sharding_max_wait: Duration::from_secs(5),
            ..CoordinatorConfig::default()
        }
    }

    #[test]
    fn create_then_load() {
        let root = tempfile::tempdir().unwrap();
        let artifact = ShardArtifact::new(root.path().join("shards"), 2);
        assert!(!artifact.is_complete());

        let man = artifact.create(&PatternWriter { fail_at: None }).unwrap();
        assert!(artifact.is_complete());
        assert_eq!(man.shards.len(), 2);
        assert!(artifact.rank_path(1).ends_with("__1_0.distcp"));

        let rank1 = artifact.load_rank(1).unwrap();
        assert_eq!(&*rank1, &[1u8; 16]);
    }

    #[test]
    fn failure_after_one_rank_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("shards");
        let artifact = ShardArtifact::new(&dir, 2);

        let err = artifact.create(&PatternWriter { fail_at: Some(1) }).unwrap_err();

        assert!(matches!(err, StoreError::PartialArtifact { .. }));
        assert!(!dir.exists());
        assert!(!artifact.is_complete());
    }

    #[test]
    fn rank_files_without_metadata_are_incomplete() {
        let root = tempfile::tempdir().unwrap();
        let artifact = ShardArtifact::new(root.path(), 2);
        fs::write(artifact.rank_path(0), b"x").unwrap();
        fs::write(artifact.rank_path(1), b"y").unwrap();
        assert!(!artifact.is_complete());
        assert!(matches!(artifact.manifest(), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn tampered_shard_fails_verification() {
        let root = tempfile::tempdir().unwrap();
        let artifact = ShardArtifact::new(root.path().join("shards"), 2);
        artifact.create(&PatternWriter { fail_at: None }).unwrap();

        fs::write(artifact.rank_path(0), [9u8; 16]).unwrap();
        let err = artifact.load_rank(0).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityMismatch { .. }));
    }

    #[test]
    fn byte_range_writer_splits_source() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("dit.safetensors");
        let payload: Vec<u8> = (0..=254).collect();
        fs::write(&source, &payload).unwrap();

        let artifact = ShardArtifact::new(root.path().join("shards"), 2);
        let writer = ByteRangeShardWriter::new(&source, ModelComponent::Denoiser);
        artifact.create(&writer).unwrap();

        let a = fs::read(artifact.rank_path(0)).unwrap();
        let b = fs::read(artifact.rank_path(1)).unwrap();
        assert_eq!(a.len(), 128);
        assert_eq!(b.len(), 127);
        assert_eq!([a, b].concat(), payload);
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let artifact = ShardArtifact::new(root.path().join("shards"), 2);
        let writer = PatternWriter { fail_at: None };

        let first = artifact.ensure(&writer, &fast_config()).await.unwrap();
        assert_eq!(first, CoordinationOutcome::Performed);
        assert!(!artifact.dir().join(".sharding.lock").exists());

        let second = artifact.ensure(&writer, &fast_config()).await.unwrap();
        assert_eq!(second, CoordinationOutcome::AlreadyComplete);
    }

    #[tokio::test]
    async fn ensure_surfaces_partial_artifact() {
        let root = tempfile::tempdir().unwrap();
        let artifact = ShardArtifact::new(root.path().join("shards"), 2);

        let err = artifact
            .ensure(&PatternWriter { fail_at: Some(1) }, &fast_config())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PartialArtifact { .. }));
        assert!(!artifact.dir().exists());
    }
}
