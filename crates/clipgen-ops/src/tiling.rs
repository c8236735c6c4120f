//! Tiled spatial decode.
//!
//! Decoding a full `[1, C, T, H, W]` latent at once does not fit in device
//! memory, so it is cut into overlapping spatial tiles and temporal batches:
//!
//! ```text
//!          stride_w            tile_latent_w
//!         ├────────┤├───────────────────────────┤
//!   ┌─────┬────────┬─────┬──────┐
//!   │ 0,0 │ blend  │ 0,1 │ ...  │   each tile: decode frame batches, cat on T
//!   ├─────┼────────┼─────┼──────┤   seams:     cross-fade top, then left
//!   │blend│        │     │      │   crop:      keep row_limit × row_limit
//!   ├─────┼────────┼─────┼──────┤   assemble:  cat crops on W, rows on H
//!   │ 1,0 │        │ 1,1 │      │
//!   └─────┴────────┴─────┴──────┘
//! ```
//!
//! Blending mutates tiles in place in row-major order, so a tile's
//! neighbours below and to the right blend against its already-blended
//! pixels.

use std::ops::Range;

use tracing::debug;

use clipgen_types::config::TilingConfig;
use clipgen_types::Tensor;

use crate::error::{OpsError, Result};

/// Spatial upsampling factor between latent and sample space.
pub const SPATIAL_SCALE: usize = 8;

/// Latent-to-pixel decoder. Implementations may run on an accelerator.
pub trait Decoder: Send {
    /// `[1, C, t, h, w]` latent tile → `[1, C', t', h', w']` pixels.
    fn decode(&self, latent: &Tensor) -> anyhow::Result<Tensor>;
}

// ── Geometry ──────────────────────────────────────────────────────────────────

/// Derived tile sizes, all in whole elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub latent_h: usize,
    pub latent_w: usize,
    /// Step between tile origins in latent space.
    pub stride_h: usize,
    pub stride_w: usize,
    /// Overlap cross-faded in sample space.
    pub blend_h: usize,
    pub blend_w: usize,
    /// Rows / columns kept from each blended tile.
    pub row_limit_h: usize,
    pub row_limit_w: usize,
    pub frame_batch: usize,
}

impl TileGeometry {
    pub fn from_config(cfg: &TilingConfig) -> Result<Self> {
        let latent_h = cfg.tile_sample_min_height / SPATIAL_SCALE;
        let latent_w = cfg.tile_sample_min_width / SPATIAL_SCALE;
        let fh = f64::from(cfg.tile_overlap_factor_height);
        let fw = f64::from(cfg.tile_overlap_factor_width);

        let geom = Self {
            latent_h,
            latent_w,
            stride_h: (latent_h as f64 * (1.0 - fh)) as usize,
            stride_w: (latent_w as f64 * (1.0 - fw)) as usize,
            blend_h: (cfg.tile_sample_min_height as f64 * fh) as usize,
            blend_w: (cfg.tile_sample_min_width as f64 * fw) as usize,
            row_limit_h: 0,
            row_limit_w: 0,
            frame_batch: cfg.frame_batch_size,
        };
        let geom = Self {
            row_limit_h: cfg.tile_sample_min_height.saturating_sub(geom.blend_h),
            row_limit_w: cfg.tile_sample_min_width.saturating_sub(geom.blend_w),
            ..geom
        };

        if geom.stride_h == 0 || geom.stride_w == 0 || geom.frame_batch == 0 {
            return Err(OpsError::ContractViolation(format!(
                "degenerate tiling: {geom:?} from {cfg:?}"
            )));
        }
        Ok(geom)
    }

    /// Temporal batch ranges covering `t` frames.
    pub fn frame_batches(&self, t: usize) -> Vec<Range<usize>> {
        (0..t)
            .step_by(self.frame_batch)
            .map(|start| start..(start + self.frame_batch).min(t))
            .collect()
    }
}

// ── Decode ────────────────────────────────────────────────────────────────────

/// Decode `z` (`[1, C, T, H, W]`) tile by tile and reassemble.
pub fn decode_tiled(decoder: &dyn Decoder, z: &Tensor, cfg: &TilingConfig) -> Result<Tensor> {
    let (b, _c, t, h, w) = z.dims5()?;
    if b != 1 {
        return Err(OpsError::ContractViolation(format!(
            "tiled decoding supports batch size 1, got {b}"
        )));
    }
    let geom = TileGeometry::from_config(cfg)?;
    let batches = geom.frame_batches(t);
    if batches.is_empty() || h == 0 || w == 0 {
        return Err(OpsError::ContractViolation(format!(
            "nothing to decode in latent of shape {:?}",
            z.shape()
        )));
    }

    let mut rows: Vec<Vec<Tensor>> = Vec::new();
    for (ri, i) in (0..h).step_by(geom.stride_h).enumerate() {
        let tile_h = geom.latent_h.min(h - i);
        let mut row = Vec::new();
        for (ci, j) in (0..w).step_by(geom.stride_w).enumerate() {
            let tile_w = geom.latent_w.min(w - j);
            let spatial = z.narrow(3, i, tile_h)?.narrow(4, j, tile_w)?;

            let mut temporal = Vec::with_capacity(batches.len());
            for frames in &batches {
                let tile = spatial.narrow(2, frames.start, frames.len())?;
                let decoded = decoder.decode(&tile).map_err(|e| OpsError::Decode {
                    row: ri,
                    col: ci,
                    frames: frames.clone(),
                    reason: format!("{e:#}"),
                })?;
                temporal.push(decoded);
            }
            row.push(Tensor::cat(&temporal, 2)?);
        }
        rows.push(row);
    }
    debug!(
        rows = rows.len(),
        cols = rows.first().map_or(0, Vec::len),
        batches = batches.len(),
        "tiles decoded"
    );

    let mut assembled_rows = Vec::with_capacity(rows.len());
    for i in 0..rows.len() {
        let mut cropped = Vec::with_capacity(rows[i].len());
        for j in 0..rows[i].len() {
            if i > 0 {
                let (above, current) = rows.split_at_mut(i);
                blend_v(&above[i - 1][j], &mut current[0][j], geom.blend_h)?;
            }
            if j > 0 {
                let (left, current) = rows[i].split_at_mut(j);
                blend_h(&left[j - 1], &mut current[0], geom.blend_w)?;
            }
            let tile = &rows[i][j];
            let (_, _, _, th, tw) = tile.dims5()?;
            cropped.push(
                tile.narrow(3, 0, geom.row_limit_h.min(th))?
                    .narrow(4, 0, geom.row_limit_w.min(tw))?,
            );
        }
        assembled_rows.push(Tensor::cat(&cropped, 4)?);
    }
    Ok(Tensor::cat(&assembled_rows, 3)?)
}

// ── Seam blending ─────────────────────────────────────────────────────────────

/// Cross-fade the top `extent` rows of `b` with the bottom rows of `a`.
/// Row `y` of `b` becomes `a[-extent + y] * (1 - y/extent) + b[y] * (y/extent)`.
pub fn blend_v(a: &Tensor, b: &mut Tensor, extent: usize) -> Result<()> {
    let (_, ca, ta, ha, wa) = a.dims5()?;
    let (_, cb, tb, hb, wb) = b.dims5()?;
    if (ca, ta, wa) != (cb, tb, wb) {
        return Err(OpsError::ContractViolation(format!(
            "vertical blend between {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let extent = extent.min(ha).min(hb);
    if extent == 0 {
        return Ok(());
    }

    let src = a.data();
    let dst = b.data_mut();
    for plane in 0..ca * ta {
        for y in 0..extent {
            let wgt = y as f32 / extent as f32;
            let a_row = (plane * ha + ha - extent + y) * wa;
            let b_row = (plane * hb + y) * wb;
            for x in 0..wb {
                dst[b_row + x] = src[a_row + x] * (1.0 - wgt) + dst[b_row + x] * wgt;
            }
        }
    }
    Ok(())
}

/// Cross-fade the left `extent` columns of `b` with the right columns of `a`.
pub fn blend_h(a: &Tensor, b: &mut Tensor, extent: usize) -> Result<()> {
    let (_, ca, ta, ha, wa) = a.dims5()?;
    let (_, cb, tb, hb, wb) = b.dims5()?;
    if (ca, ta, ha) != (cb, tb, hb) {
        return Err(OpsError::ContractViolation(format!(
            "horizontal blend between {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let extent = extent.min(wa).min(wb);
    if extent == 0 {
        return Ok(());
    }

    let src = a.data();
    let dst = b.data_mut();
    for line in 0..ca * ta * ha {
        for x in 0..extent {
            let wgt = x as f32 / extent as f32;
            let ai = line * wa + wa - extent + x;
            let bi = line * wb + x;
            dst[bi] = src[ai] * (1.0 - wgt) + dst[bi] * wgt;
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
