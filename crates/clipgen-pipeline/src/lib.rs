//! `clipgen-pipeline` — multi-rank text-to-video inference.
//!
//! Each rank owns a [`RankContext`] (process group + text encoder, denoiser
//! and decoder) on a dedicated worker thread. The [`MultiRankPipeline`]
//! drives every rank through the same request: all ranks sample the same
//! latent, then each decodes a slice of its frames and the slices are
//! gathered back together.
//!
//! ```text
//!                 MultiRankPipeline::invoke
//!                 │           │          │
//!            ┌────▼───┐  ┌────▼───┐  ┌───▼────┐
//!            │ rank 0 │  │ rank 1 │  │ rank 2 │   encode → sample
//!            └────┬───┘  └────┬───┘  └───┬────┘
//!                 │  T[0..3]  │ T[3..5]  │ T[5..7]   tiled decode
//!                 └───────────┴──────────┘
//!                        all_gather
//!                            ▼
//!                 rank 0 result returned
//! ```

pub mod context;
pub mod context_parallel;
pub mod error;
pub mod factory;
pub mod generate;
pub mod orchestrator;
pub mod schedule;
pub mod smoke;
pub mod timer;
pub mod worker;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use context::{ContextState, RankContext, RankParts};
pub use context_parallel::{decode_distributed, gather_frames, pass_frames, split_latent};
pub use error::{PipelineError, Result};
pub use factory::{
    Decoder, DecoderFactory, Denoiser, DenoiserFactory, ModelFactories, ModelFactory,
    TextEncoder, TextEncoderFactory,
};
pub use generate::{generate, initial_latent, latent_shape};
pub use orchestrator::MultiRankPipeline;
pub use schedule::{cfg_schedule, linear_quadratic_schedule};
pub use timer::StageTimer;
pub use worker::RankWorker;
