//! `clipgen-store` — shared-filesystem setup for worker replicas.
//!
//! Many identical workers start against the same volume. Expensive first-use
//! work (downloading weights, sharding a checkpoint) must happen once, and
//! everyone else must wait for it rather than race it:
//!
//! ```text
//!   worker A ──┐                        ┌── weights/.download.lock   (A holds)
//!   worker B ──┼── coordinate_pod_work ─┤
//!   worker C ──┘                        └── B, C poll is_complete()
//! ```

pub mod coordinator;
pub mod error;
pub mod lockfile;
pub mod manifest;
pub mod report;
pub mod shards;
pub mod verify;
pub mod weights;

pub use coordinator::{
    coordinate_pod_work, coordinate_with_retry, CoordinationOutcome, PodWork,
};
pub use error::{Result, StoreError};
pub use lockfile::{LockGuard, LockOutcome};
pub use shards::{ByteRangeShardWriter, ShardArtifact, ShardWriter};
pub use weights::{LocalMirrorFetcher, WeightFetcher, WeightSet};

use tracing::info;

use clipgen_types::config::{CoordinatorConfig, StoreConfig};
use clipgen_types::model::{ModelComponent, ModelFile};

/// Top-level entry: make sure weights and the denoiser checkpoint for
/// `world_size` ranks exist on the shared volume.
pub struct PodSetup {
    pub store: StoreConfig,
    pub coordinator: CoordinatorConfig,
}

impl PodSetup {
    pub fn new(store: StoreConfig, coordinator: CoordinatorConfig) -> Self {
        Self { store, coordinator }
    }

    pub fn weight_set(&self) -> WeightSet {
        WeightSet::new(&self.store.weights_dir, ModelFile::mochi_defaults())
    }

    pub fn shard_artifact(&self, world_size: usize) -> ShardArtifact {
        ShardArtifact::new(&self.store.shards_dir, world_size)
    }

    /// Download weights, then shard the denoiser when more than one rank
    /// will load it.
    pub async fn prepare(
        &self,
        fetcher: &dyn WeightFetcher,
        world_size: usize,
    ) -> Result<()> {
        let weights = self.weight_set();
        let outcome = weights.ensure(fetcher, &self.coordinator).await?;
        if !outcome.is_complete() {
            return Err(StoreError::Other("weights still incomplete after retries".into()));
        }
        report::scan_dir(weights.dir())?.log(weights.dir());

        if world_size > 1 {
            let dit = weights
                .files()
                .iter()
                .find(|f| f.file_name == "dit.safetensors")
                .map(|f| weights.path_of(f))
                .ok_or_else(|| StoreError::NotFound("dit.safetensors".into()))?;
            let writer = ByteRangeShardWriter::new(dit, ModelComponent::Denoiser);
            let outcome = self
                .shard_artifact(world_size)
                .ensure(&writer, &self.coordinator)
                .await?;
            if !outcome.is_complete() {
                return Err(StoreError::Other("checkpoint still incomplete after retries".into()));
            }
        }

        info!(world_size, "pod setup complete");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
