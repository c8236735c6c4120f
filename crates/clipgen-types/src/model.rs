// Model component and shard descriptor types.
//
// Consumed by `clipgen-store`, `clipgen-pipeline`, and `clipgen-node`.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Model Components ─────────────────────────────────────────────────────────

/// The three independently loaded parts of the video diffusion model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelComponent {
    TextEncoder,
    Denoiser,
    Decoder,
}

impl ModelComponent {
    /// Load order used by rank contexts.
    pub const LOAD_ORDER: [ModelComponent; 3] =
        [Self::TextEncoder, Self::Denoiser, Self::Decoder];
}

impl fmt::Display for ModelComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TextEncoder => write!(f, "text_encoder"),
            Self::Denoiser    => write!(f, "denoiser"),
            Self::Decoder     => write!(f, "decoder"),
        }
    }
}

// ── Device Binding ───────────────────────────────────────────────────────────

/// Where a model component is being loaded: which rank, out of how many, on
/// which accelerator ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    pub rank: usize,
    pub world_size: usize,
    pub device: usize,
}

impl DeviceBinding {
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self { rank, world_size, device: rank }
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

// ── Model Files ──────────────────────────────────────────────────────────────

/// One downloadable weight file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFile {
    /// Hub repository that hosts the file (e.g. `"genmo/mochi-1-preview"`).
    pub repo_id: String,
    /// File name, relative to the repository root and to the local weights dir.
    pub file_name: String,
}

impl ModelFile {
    pub fn new(repo_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self { repo_id: repo_id.into(), file_name: file_name.into() }
    }

    /// Weight files needed to run the Mochi pipeline.
    pub fn mochi_defaults() -> Vec<ModelFile> {
        vec![
            Self::new("genmo/mochi-1-preview", "decoder.safetensors"),
            Self::new("genmo/mochi-1-preview", "dit.safetensors"),
            Self::new("comfyanonymous/flux_text_encoders", "t5xxl_fp16.safetensors"),
        ]
    }
}

// ── Shard Manifest ───────────────────────────────────────────────────────────

/// One rank's file inside a sharded checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub rank: usize,
    /// File name relative to the shard directory (`__{rank}_0.distcp`).
    pub file_name: String,
    pub size_bytes: u64,
    /// BLAKE3 hash of the file contents (hex-encoded, 64 chars).
    pub blake3_hash: String,
}

/// Content of a sharded checkpoint's `.metadata` file.
///
/// Serialized as CBOR on disk; JSON for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardManifest {
    pub world_size: usize,
    /// Which component the checkpoint holds.
    pub component: ModelComponent,
    pub shards: Vec<ShardDescriptor>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ShardManifest {
    pub fn shard(&self, rank: usize) -> Option<&ShardDescriptor> {
        self.shards.iter().find(|s| s.rank == rank)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_display() {
        assert_eq!(ModelComponent::TextEncoder.to_string(), "text_encoder");
        assert_eq!(ModelComponent::Decoder.to_string(), "decoder");
    }

    #[test]
    fn binding_pins_device_to_rank() {
        let b = DeviceBinding::new(3, 4);
        assert_eq!(b.device, 3);
        assert!(!b.is_coordinator());
        assert!(DeviceBinding::new(0, 4).is_coordinator());
    }

    #[test]
    fn mochi_file_set() {
        let files = ModelFile::mochi_defaults();
        assert_eq!(files.len(), 3);
        assert!(files.iter().any(|f| f.file_name == "dit.safetensors"));
    }

    #[test]
    fn manifest_lookup_by_rank() {
        let m = ShardManifest {
            world_size: 2,
            component: ModelComponent::Denoiser,
            shards: vec![
                ShardDescriptor {
                    rank: 1,
                    file_name: "__1_0.distcp".into(),
                    size_bytes: 8,
                    blake3_hash: "a".repeat(64),
                },
            ],
            created_at: chrono::Utc::now(),
        };
        assert!(m.shard(0).is_none());
        assert_eq!(m.shard(1).unwrap().file_name, "__1_0.distcp");

        let json = serde_json::to_string(&m).unwrap();
        let round: ShardManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(round, m);
    }
}
