//! What every rank runs for one request: encode prompts, sample the latent,
//! decode its share of frames and gather the video.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use clipgen_types::config::PipelineConfig;
use clipgen_types::{GenerationRequest, ModelComponent, Tensor};

use crate::context::{RankContext, RankParts};
use crate::context_parallel::decode_distributed;
use crate::error::{PipelineError, Result};
use crate::schedule::{cfg_schedule, linear_quadratic_schedule, DEFAULT_THRESHOLD_NOISE};

pub const LATENT_CHANNELS: usize = 12;
pub const TEMPORAL_DOWNSAMPLE: usize = 6;
pub const SPATIAL_DOWNSAMPLE: usize = 8;

/// `[1, C, T, H, W]` latent shape for a request.
pub fn latent_shape(req: &GenerationRequest) -> Result<[usize; 5]> {
    if req.height % SPATIAL_DOWNSAMPLE != 0 || req.width % SPATIAL_DOWNSAMPLE != 0 {
        return Err(PipelineError::InvalidRequest(format!(
            "height and width must be multiples of {SPATIAL_DOWNSAMPLE}, got {}x{}",
            req.height, req.width
        )));
    }
    let frames = (req.num_frames.max(1) - 1) / TEMPORAL_DOWNSAMPLE + 1;
    Ok([
        1,
        LATENT_CHANNELS,
        frames,
        req.height / SPATIAL_DOWNSAMPLE,
        req.width / SPATIAL_DOWNSAMPLE,
    ])
}

/// Seeded standard-normal noise. Identical on every rank for the same seed.
pub fn initial_latent(shape: &[usize], seed: u64) -> Tensor {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Tensor::from_fn(shape, |_| {
        // Box-Muller; keep u1 away from zero.
        let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
        let u2: f32 = rng.gen();
        (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
    })
}

/// Run the whole request on this rank. Must be called on every rank.
pub fn generate(ctx: &mut RankContext, req: &GenerationRequest, config: &PipelineConfig) -> Result<Tensor> {
    let shape = latent_shape(req)?;
    let parts = ctx.parts()?;
    let rank = parts.binding.rank;

    let model_err = |component: ModelComponent| {
        move |e: anyhow::Error| PipelineError::Model { rank, component, reason: format!("{e:#}") }
    };
    let cond = parts
        .text_encoder
        .encode(&req.prompt)
        .map_err(model_err(ModelComponent::TextEncoder))?;
    let uncond = parts
        .text_encoder
        .encode(&req.negative_prompt)
        .map_err(model_err(ModelComponent::TextEncoder))?;

    let latent = sample(&parts, req, &shape, &cond, &uncond)?;
    if rank == 0 {
        info!(shape = ?latent.shape(), "sampling complete");
    }

    let RankParts { group, decoder, .. } = parts;
    decode_distributed(decoder, group, &latent, &config.tiling, config.frames_to_exchange)
}

/// Euler integration of the guided velocity field over the sigma schedule.
fn sample(
    parts: &RankParts<'_>,
    req: &GenerationRequest,
    shape: &[usize],
    cond: &Tensor,
    uncond: &Tensor,
) -> Result<Tensor> {
    let rank = parts.binding.rank;
    let steps = req.num_inference_steps;
    let sigmas = linear_quadratic_schedule(steps, DEFAULT_THRESHOLD_NOISE, None);
    let cfgs = cfg_schedule(steps, req.guidance_scale);

    let mut z = initial_latent(shape, req.seed);
    for (i, &guidance) in cfgs.iter().enumerate() {
        let (sigma, next) = (sigmas[i], sigmas[i + 1]);
        let predict = |c: &Tensor| {
            parts.denoiser.predict(&z, sigma, c).map_err(|e| PipelineError::Model {
                rank,
                component: ModelComponent::Denoiser,
                reason: format!("step {i}: {e:#}"),
            })
        };
        let v_cond = predict(cond)?;
        let v_uncond = predict(uncond)?;
        if v_cond.shape() != z.shape() || v_uncond.shape() != z.shape() {
            return Err(PipelineError::Model {
                rank,
                component: ModelComponent::Denoiser,
                reason: format!("prediction shape {:?} != latent {:?}", v_cond.shape(), z.shape()),
            });
        }

        let dsigma = sigma - next;
        for ((zi, c), u) in z.data_mut().iter_mut().zip(v_cond.data()).zip(v_uncond.data()) {
            *zi += dsigma * (u + guidance * (c - u));
        }
        if rank == 0 {
            debug!(step = i + 1, steps, sigma, "denoise step");
        }
    }
    Ok(z)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
