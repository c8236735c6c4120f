// Global configuration structs.
//
// Everything is resolved once at process start (`RuntimeConfig::from_env`)
// and threaded through construction. Nothing below re-reads the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ClipgenError;

// ── Coordination ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often a waiting process re-checks the completion predicate.
    /// Default: 30 s.
    pub poll_interval: Duration,

    /// Upper bound on waiting for a peer's weight download. Default: 30 min.
    pub download_max_wait: Duration,

    /// Upper bound on waiting for a peer's checkpoint sharding. Default: 10 min.
    pub sharding_max_wait: Duration,

    /// How many times `RetryNeeded` is retried before giving up. Default: 3.
    pub max_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            download_max_wait: Duration::from_secs(1800),
            sharding_max_wait: Duration::from_secs(600),
            max_attempts: 3,
        }
    }
}

// ── Storage ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the downloaded weight files.
    /// Defaults to `$HOME/.clipgen/weights/`.
    pub weights_dir: PathBuf,

    /// Directory holding the sharded checkpoint.
    /// Defaults to `$HOME/.clipgen/shards/`.
    pub shards_dir: PathBuf,

    /// Shared volume to copy weights from, if any.
    pub mirror_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let root = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp/clipgen"))
            .join(".clipgen");

        Self {
            weights_dir: root.join("weights"),
            shards_dir: root.join("shards"),
            mirror_dir: None,
        }
    }
}

// ── Decode tiling ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TilingConfig {
    /// Tile height in output pixels. Latent tile height is this / 8.
    pub tile_sample_min_height: usize,
    /// Tile width in output pixels. Latent tile width is this / 8.
    pub tile_sample_min_width: usize,
    pub tile_overlap_factor_height: f32,
    pub tile_overlap_factor_width: f32,
    /// Latent frames decoded per decoder call.
    pub frame_batch_size: usize,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_sample_min_height: 240,
            tile_sample_min_width: 424,
            tile_overlap_factor_height: 0.1666,
            tile_overlap_factor_width: 0.2,
            frame_batch_size: 16,
        }
    }
}

// ── Kernels ───────────────────────────────────────────────────────────────────

/// Requested pack/unpack implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackKernelChoice {
    /// Use the accelerated kernel when the host supports it.
    #[default]
    Auto,
    Reference,
    Parallel,
}

impl FromStr for PackKernelChoice {
    type Err = ClipgenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "reference" | "ref" | "0" => Ok(Self::Reference),
            "parallel" | "1" => Ok(Self::Parallel),
            other => Err(ClipgenError::Config(format!("unknown pack kernel: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KernelConfig {
    pub pack: PackKernelChoice,
}

// ── Process groups ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Rendezvous host for the TCP mesh. Default: 127.0.0.1.
    pub master_addr: String,
    /// Rank `r` listens on `master_port + r`. Default: 29500.
    pub master_port: u16,
    /// Largest collective frame accepted from a peer. Default: 1 GiB.
    pub max_frame_bytes: usize,
    /// Receive timeout inside collectives. `None` waits forever.
    pub collective_timeout: Option<Duration>,
    /// How long to keep retrying connections to lower ranks. Default: 60 s.
    pub connect_timeout: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1".into(),
            master_port: 29500,
            max_frame_bytes: 1024 * 1024 * 1024,
            collective_timeout: Some(Duration::from_secs(600)),
            connect_timeout: Duration::from_secs(60),
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of ranks. Default: 1.
    pub world_size: usize,
    /// Bound on group join + model loading across all ranks. Default: 20 min.
    pub init_timeout: Duration,
    /// Bound on one `invoke`. Default: 30 min.
    pub request_timeout: Duration,
    /// Frames each rank passes to its successor before decoding. 0 disables
    /// the exchange.
    pub frames_to_exchange: usize,
    pub tiling: TilingConfig,
    /// Pack kernel every rank is handed, resolved once at startup.
    pub kernel: KernelConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            init_timeout: Duration::from_secs(1200),
            request_timeout: Duration::from_secs(1800),
            frames_to_exchange: 0,
            tiling: TilingConfig::default(),
            kernel: KernelConfig::default(),
        }
    }
}

// ── Runtime ───────────────────────────────────────────────────────────────────

/// Every knob, resolved once.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub coordinator: CoordinatorConfig,
    pub store: StoreConfig,
    pub net: NetConfig,
    pub pipeline: PipelineConfig,
}

impl RuntimeConfig {
    /// Defaults overlaid with `CLIPGEN_*` environment variables.
    pub fn from_env() -> Result<Self, ClipgenError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClipgenError> {
        let mut cfg = Self::default();

        if let Some(v) = lookup("CLIPGEN_WORLD_SIZE") {
            cfg.pipeline.world_size = parse_var("CLIPGEN_WORLD_SIZE", &v)?;
            if cfg.pipeline.world_size == 0 {
                return Err(ClipgenError::Config("CLIPGEN_WORLD_SIZE must be at least 1".into()));
            }
        }
        if let Some(v) = lookup("CLIPGEN_PACK_KERNEL") {
            cfg.pipeline.kernel.pack = v.parse()?;
        }
        if let Some(v) = lookup("CLIPGEN_WEIGHTS_DIR") {
            cfg.store.weights_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLIPGEN_SHARDS_DIR") {
            cfg.store.shards_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLIPGEN_MIRROR_DIR") {
            cfg.store.mirror_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CLIPGEN_MASTER_ADDR") {
            cfg.net.master_addr = v;
        }
        if let Some(v) = lookup("CLIPGEN_MASTER_PORT") {
            cfg.net.master_port = parse_var("CLIPGEN_MASTER_PORT", &v)?;
        }
        if let Some(v) = lookup("CLIPGEN_POLL_INTERVAL_SECS") {
            cfg.coordinator.poll_interval =
                Duration::from_secs(parse_var("CLIPGEN_POLL_INTERVAL_SECS", &v)?);
        }

        Ok(cfg)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, ClipgenError> {
    value
        .trim()
        .parse()
        .map_err(|_| ClipgenError::Config(format!("invalid value for {key}: {value:?}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.coordinator.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.coordinator.download_max_wait, Duration::from_secs(1800));
        assert_eq!(cfg.pipeline.world_size, 1);
        assert_eq!(cfg.pipeline.tiling.frame_batch_size, 16);
        assert_eq!(cfg.pipeline.kernel.pack, PackKernelChoice::Auto);
        assert!(cfg.store.weights_dir.ends_with("weights"));
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CLIPGEN_WORLD_SIZE", "4"),
            ("CLIPGEN_PACK_KERNEL", "reference"),
            ("CLIPGEN_MASTER_PORT", "31000"),
            ("CLIPGEN_SHARDS_DIR", "/data/shards"),
        ]
        .into_iter()
        .collect();

        let cfg = RuntimeConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.pipeline.world_size, 4);
        assert_eq!(cfg.pipeline.kernel.pack, PackKernelChoice::Reference);
        assert_eq!(cfg.net.master_port, 31000);
        assert_eq!(cfg.store.shards_dir, PathBuf::from("/data/shards"));
    }

    #[test]
    fn bad_values_rejected() {
        let err = RuntimeConfig::from_lookup(|k| {
            (k == "CLIPGEN_WORLD_SIZE").then(|| "zero".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ClipgenError::Config(_)));

        assert!(RuntimeConfig::from_lookup(|k| {
            (k == "CLIPGEN_WORLD_SIZE").then(|| "0".to_string())
        })
        .is_err());

        assert!("triton".parse::<PackKernelChoice>().is_err());
    }
}
