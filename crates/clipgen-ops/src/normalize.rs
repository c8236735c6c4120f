//! Decoder output → displayable frames.

use clipgen_types::Tensor;

use crate::error::{OpsError, Result};

/// Map decoder output from `[-1, 1]` to `[0, 1]`, clamping outliers.
pub fn normalize_frames(video: &mut Tensor) {
    video.map_inplace(|x| ((x + 1.0) / 2.0).clamp(0.0, 1.0));
}

/// Interleaved 8-bit RGB frames, `height * width * 3` bytes each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrames {
    pub height: usize,
    pub width: usize,
    pub frames: Vec<Vec<u8>>,
}

impl RgbFrames {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Pixel `(y, x)` of frame `t`.
    pub fn pixel(&self, t: usize, y: usize, x: usize) -> Option<[u8; 3]> {
        let frame = self.frames.get(t)?;
        let at = (y * self.width + x) * 3;
        frame.get(at..at + 3).map(|p| [p[0], p[1], p[2]])
    }
}

/// Convert a normalized `[1, 3, T, H, W]` video into per-frame HWC bytes.
pub fn frames_to_rgb8(video: &Tensor) -> Result<RgbFrames> {
    let (b, c, t, h, w) = video.dims5()?;
    if b != 1 || c != 3 {
        return Err(OpsError::ContractViolation(format!(
            "expected a [1, 3, T, H, W] video, got {:?}",
            video.shape()
        )));
    }

    let data = video.data();
    let plane = h * w;
    let frames = (0..t)
        .map(|f| {
            let mut out = Vec::with_capacity(plane * 3);
            for px in 0..plane {
                for ch in 0..3 {
                    let v = data[(ch * t + f) * plane + px];
                    out.push((v.clamp(0.0, 1.0) * 255.0).round() as u8);
                }
            }
            out
        })
        .collect();

    Ok(RgbFrames { height: h, width: w, frames })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
