//! Context-parallel decode: each rank decodes a slice of the latent's frames
//! and the slices are gathered back in rank order.
//!
//! ```text
//!   latent [1, C, T, H, W]
//!      │ split along T (first T % N ranks take one extra frame)
//!      ▼
//!   rank r: chunk_r ──(optional: prepend k frames from rank r-1)──► tiled decode
//!      │                               drop the frames decoded from those k ◄┘
//!      ▼ all_gather sizes → pad to max → all_gather → trim → cat along T
//!   video [1, C', ΣT_r, H', W'] → clamp((x + 1) / 2, 0, 1)
//! ```
//!
//! Every rank must reach each collective; a rank that errors out before the
//! gather leaves the others waiting until the collective timeout.

use tracing::debug;

use clipgen_net::ProcessGroup;
use clipgen_ops::{decode_tiled, normalize_frames, Decoder, OpsError};
use clipgen_types::config::TilingConfig;
use clipgen_types::Tensor;

use crate::error::Result;

const TIME_AXIS: usize = 2;

/// This rank's contiguous share of `latent`'s frames.
pub fn split_latent(latent: &Tensor, rank: usize, world_size: usize) -> Result<Tensor> {
    let mut chunks = latent.split_even(TIME_AXIS, world_size)?;
    if rank >= chunks.len() {
        return Err(OpsError::ContractViolation(format!(
            "rank {rank} out of range for world size {world_size}"
        ))
        .into());
    }
    Ok(chunks.swap_remove(rank))
}

/// Send the trailing `k` frames to rank + 1 and prepend the `k` frames
/// received from rank - 1. A no-op for `k == 0` or a single rank.
pub fn pass_frames(group: &mut dyn ProcessGroup, x: Tensor, k: usize) -> Result<Tensor> {
    let (rank, world) = (group.rank(), group.world_size());
    if k == 0 || world == 1 {
        return Ok(x);
    }
    let t = x.dim(TIME_AXIS)?;
    if t < k {
        return Err(OpsError::ContractViolation(format!(
            "rank {rank} holds {t} frames, cannot pass {k}"
        ))
        .into());
    }

    if rank + 1 < world {
        group.send(rank + 1, &x.narrow(TIME_AXIS, t - k, k)?)?;
    }
    if rank > 0 {
        let head = group.recv(rank - 1)?;
        if head.dim(TIME_AXIS)? != k {
            return Err(OpsError::ContractViolation(format!(
                "rank {} sent {:?}, expected {k} frames",
                rank - 1,
                head.shape()
            ))
            .into());
        }
        return Ok(Tensor::cat(&[head, x], TIME_AXIS)?);
    }
    Ok(x)
}

/// Concatenate every rank's frames in rank order. Local frame counts may
/// differ; padding used to make the exchange uniform is trimmed away.
pub fn gather_frames(group: &mut dyn ProcessGroup, local: &Tensor) -> Result<Tensor> {
    if group.world_size() == 1 {
        return Ok(local.clone());
    }
    let sizes = group.all_gather_sizes(local.dim(TIME_AXIS)?)?;
    let max_t = sizes.iter().copied().max().unwrap_or(0);
    let padded = local.pad_axis_end(TIME_AXIS, max_t)?;

    let gathered = group.all_gather(&padded)?;
    let trimmed = gathered
        .iter()
        .zip(&sizes)
        .map(|(t, &n)| t.narrow(TIME_AXIS, 0, n))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    debug!(rank = group.rank(), ?sizes, "frames gathered");
    Ok(Tensor::cat(&trimmed, TIME_AXIS)?)
}

/// Strip the frames a rank decoded from its left neighbour's `context`
/// latent frames, keeping only the ones that belong to its own slice. The
/// decoder is taken to emit the same number of frames per latent frame.
fn drop_context_frames(decoded: Tensor, latent_t: usize, context: usize) -> Result<Tensor> {
    if context == 0 {
        return Ok(decoded);
    }
    let decoded_t = decoded.dim(TIME_AXIS)?;
    if latent_t == 0 || decoded_t % latent_t != 0 {
        return Err(OpsError::ContractViolation(format!(
            "decoder turned {latent_t} latent frames into {decoded_t}; \
             neighbour frames need a whole number per latent frame"
        ))
        .into());
    }
    let lead = context * (decoded_t / latent_t);
    Ok(decoded.narrow(TIME_AXIS, lead, decoded_t - lead)?)
}

/// Decode `latent` across every rank of `group` and return the normalized
/// video on each of them.
pub fn decode_distributed(
    decoder: &dyn Decoder,
    group: &mut dyn ProcessGroup,
    latent: &Tensor,
    tiling: &TilingConfig,
    frames_to_exchange: usize,
) -> Result<Tensor> {
    let (rank, world) = (group.rank(), group.world_size());

    let mut video = if world == 1 {
        decode_tiled(decoder, latent, tiling)?
    } else {
        let t = latent.dim(TIME_AXIS)?;
        if t < world {
            return Err(OpsError::ContractViolation(format!(
                "{t} latent frames cannot be split across {world} ranks"
            ))
            .into());
        }
        let chunk = split_latent(latent, rank, world)?;
        let chunk = pass_frames(group, chunk, frames_to_exchange)?;
        debug!(rank, frames = chunk.dim(TIME_AXIS)?, "decoding slice");
        let decoded = decode_tiled(decoder, &chunk, tiling)?;
        let context = if rank > 0 { frames_to_exchange } else { 0 };
        let own = drop_context_frames(decoded, chunk.dim(TIME_AXIS)?, context)?;
        gather_frames(group, &own)?
    };

    normalize_frames(&mut video);
    Ok(video)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
