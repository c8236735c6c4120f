//! clipgen worker binary.
//!
//! ```bash
//! # Populate the shared volume once per pod (safe to run on every replica)
//! CLIPGEN_MIRROR_DIR=/mnt/mirror cargo run --bin clipgen-node -- prepare --world-size 2
//!
//! # Render one clip with two in-process ranks, raw rgb24 frames to a file
//! RUST_LOG=info cargo run --bin clipgen-node -- --world-size 2 \
//!     generate "a paper boat on a pond" --output boat.rgb
//!
//! # Serve JSON-lines jobs from stdin, one JSON result per line on stdout
//! cargo run --bin clipgen-node -- serve --output-dir /tmp/clips < jobs.jsonl
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clipgen_net::{LocalMesh, Rendezvous, TcpRendezvous};
use clipgen_ops::{frames_to_rgb8, RgbFrames};
use clipgen_pipeline::{smoke, ModelFactories, MultiRankPipeline};
use clipgen_store::{LocalMirrorFetcher, PodSetup};
use clipgen_types::config::RuntimeConfig;
use clipgen_types::{GenerationRequest, InferenceRequest, InferenceResult};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "clipgen-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Multi-rank text-to-video worker"
)]
struct Cli {
    #[command(flatten)]
    ranks: RankArgs,

    #[command(subcommand)]
    command: Command,
}

/// Overrides for the `CLIPGEN_*` environment.
#[derive(Args)]
struct RankArgs {
    /// Number of ranks (defaults to CLIPGEN_WORLD_SIZE, then 1).
    #[arg(long, global = true)]
    world_size: Option<usize>,

    /// How ranks reach each other.
    #[arg(long, global = true, value_enum, default_value_t = Transport::Local)]
    transport: Transport,

    /// Rendezvous host for `--transport tcp`.
    #[arg(long, global = true)]
    master_addr: Option<String>,

    /// Base port for `--transport tcp`; rank r listens on port + r.
    #[arg(long, global = true)]
    master_port: Option<u16>,

    /// Model implementation loaded on every rank.
    #[arg(long, global = true, value_enum, default_value_t = Backend::Smoke)]
    backend: Backend,
}

#[derive(Clone, Copy, ValueEnum)]
enum Transport {
    /// All ranks are threads of this process.
    Local,
    /// Full TCP mesh between ranks.
    Tcp,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// Deterministic stand-in models; no accelerator needed.
    Smoke,
}

#[derive(Subcommand)]
enum Command {
    /// Download weights and shard the checkpoint on the shared volume.
    Prepare {
        /// Mirror directory to copy weights from (defaults to CLIPGEN_MIRROR_DIR).
        #[arg(long)]
        mirror_dir: Option<PathBuf>,
    },

    /// Generate one clip and write raw rgb24 frames.
    Generate {
        prompt: String,
        #[arg(long, default_value = "")]
        negative_prompt: String,
        #[arg(long, default_value_t = 25)]
        num_frames: usize,
        #[arg(long, default_value_t = 480)]
        height: usize,
        #[arg(long, default_value_t = 848)]
        width: usize,
        #[arg(long, default_value_t = 64)]
        steps: usize,
        #[arg(long, default_value_t = 6.0)]
        guidance_scale: f32,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Output file; frames are written back to back.
        #[arg(long, short)]
        output: PathBuf,
    },

    /// Read JSON-lines jobs from stdin until EOF.
    Serve {
        /// Where rendered clips are written, one `<job_id>.rgb` each.
        #[arg(long, default_value = "clips")]
        output_dir: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level: INFO. Logs go to stderr so `serve` owns stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli    = Cli::parse();
    let config = resolve_config(RuntimeConfig::from_env()?, &cli.ranks);

    match cli.command {
        Command::Prepare { mirror_dir } => run_prepare(config, mirror_dir).await,
        Command::Generate {
            prompt,
            negative_prompt,
            num_frames,
            height,
            width,
            steps,
            guidance_scale,
            seed,
            output,
        } => {
            let req = GenerationRequest {
                prompt,
                negative_prompt,
                num_frames,
                height,
                width,
                num_inference_steps: steps,
                guidance_scale,
                seed,
            };
            run_generate(&config, &cli.ranks, req, &output).await
        }
        Command::Serve { output_dir } => run_serve(&config, &cli.ranks, &output_dir).await,
    }
}

/// Environment first, flags on top.
fn resolve_config(mut config: RuntimeConfig, args: &RankArgs) -> RuntimeConfig {
    if let Some(n) = args.world_size {
        config.pipeline.world_size = n;
    }
    if let Some(addr) = &args.master_addr {
        config.net.master_addr = addr.clone();
    }
    if let Some(port) = args.master_port {
        config.net.master_port = port;
    }
    config
}

async fn start_pipeline(config: &RuntimeConfig, args: &RankArgs) -> Result<MultiRankPipeline> {
    let world_size = config.pipeline.world_size;
    let rendezvous: Arc<dyn Rendezvous> = match args.transport {
        Transport::Local => Arc::new(LocalMesh::new(world_size, config.net.collective_timeout)),
        Transport::Tcp => Arc::new(TcpRendezvous::new(config.net.clone())),
    };
    let factories: ModelFactories = match args.backend {
        Backend::Smoke => smoke::factories(),
    };

    MultiRankPipeline::new(config.pipeline.clone(), rendezvous, factories)
        .await
        .context("starting pipeline")
}

// ── Prepare ───────────────────────────────────────────────────────────────────

async fn run_prepare(config: RuntimeConfig, mirror_dir: Option<PathBuf>) -> Result<()> {
    let mirror = mirror_dir
        .or_else(|| config.store.mirror_dir.clone())
        .context("no weight source: pass --mirror-dir or set CLIPGEN_MIRROR_DIR")?;
    let world_size = config.pipeline.world_size;

    let setup = PodSetup::new(config.store, config.coordinator);
    setup
        .prepare(&LocalMirrorFetcher::new(mirror), world_size)
        .await
        .context("preparing shared volume")?;
    Ok(())
}

// ── Generate ──────────────────────────────────────────────────────────────────

async fn run_generate(
    config: &RuntimeConfig,
    args: &RankArgs,
    req: GenerationRequest,
    output: &Path,
) -> Result<()> {
    let mut pipeline = start_pipeline(config, args).await?;
    let started = Instant::now();
    let video = pipeline.invoke(&req).await?;
    let frames = frames_to_rgb8(&video)?;
    write_frames(output, &frames).await?;
    info!(
        path = %output.display(),
        frames = frames.len(),
        height = frames.height,
        width = frames.width,
        secs = started.elapsed().as_secs_f64(),
        "clip written"
    );
    pipeline.shutdown();
    Ok(())
}

async fn write_frames(path: &Path, frames: &RgbFrames) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    for frame in &frames.frames {
        file.write_all(frame).await?;
    }
    file.flush().await?;
    Ok(())
}

// ── Serve ─────────────────────────────────────────────────────────────────────

async fn run_serve(config: &RuntimeConfig, args: &RankArgs, output_dir: &Path) -> Result<()> {
    let mut pipeline = start_pipeline(config, args).await?;
    tokio::fs::create_dir_all(output_dir).await?;
    info!(dir = %output_dir.display(), "serving jobs from stdin");

    let mut lines  = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let result = match serde_json::from_str::<InferenceRequest>(&line) {
            Ok(job) => process_job(&pipeline, job, output_dir).await,
            Err(e) => {
                warn!(error = %e, "unparseable job line");
                failed_result(String::new(), 0.0, format!("invalid job: {e}"))
            }
        };
        let mut out = serde_json::to_vec(&result)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    info!("stdin closed, shutting down");
    pipeline.shutdown();
    Ok(())
}

/// Run one job. Failures are reported in the result, never as an error, so
/// one bad job does not stop the loop.
async fn process_job(pipeline: &MultiRankPipeline, job: InferenceRequest, dir: &Path) -> InferenceResult {
    let started = Instant::now();
    info!(job_id = %job.job_id, user_id = %job.user_id, "job received");

    let output_path = dir.join(format!("{}.rgb", job.job_id));
    let rendered = async {
        let req = GenerationRequest::from_input(&job.input_data)?;
        let video = pipeline.invoke(&req).await?;
        let frames = frames_to_rgb8(&video)?;
        write_frames(&output_path, &frames).await?;
        anyhow::Ok(frames)
    }
    .await;
    let secs = started.elapsed().as_secs_f64();

    match rendered {
        Ok(frames) => {
            info!(job_id = %job.job_id, secs, "job complete");
            InferenceResult {
                job_id: job.job_id,
                output_path,
                processing_time: secs,
                metadata: Some(serde_json::json!({
                    "format": "rgb24",
                    "frames": frames.len(),
                    "height": frames.height,
                    "width": frames.width,
                    "output_bucket": job.output_bucket,
                })),
                completed_at: chrono::Utc::now(),
            }
        }
        Err(e) => {
            let reason = format!("{e:#}");
            warn!(job_id = %job.job_id, error = %reason, "job failed");
            failed_result(job.job_id, secs, reason)
        }
    }
}

fn failed_result(job_id: String, secs: f64, error: String) -> InferenceResult {
    InferenceResult {
        job_id,
        output_path: PathBuf::new(),
        processing_time: secs,
        metadata: Some(serde_json::json!({ "error": error })),
        completed_at: chrono::Utc::now(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
