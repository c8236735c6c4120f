//! Deterministic stand-in models.
//!
//! They exercise the full multi-rank path (conditioning, sampling,
//! distributed tiled decode) on hosts without accelerators. The denoiser
//! pulls every latent toward a prompt-derived target, so a finished sample is
//! flat and easy to check.

use std::sync::Arc;

use clipgen_ops::tiling::SPATIAL_SCALE;
use clipgen_types::{DeviceBinding, Tensor};

use crate::factory::{Decoder, Denoiser, ModelFactories, TextEncoder};

/// Width of the conditioning vector.
pub const EMBED_DIM: usize = 8;
/// Channels produced by the decoder.
pub const RGB_CHANNELS: usize = 3;

/// Embeds a prompt as bytes of its BLAKE3 hash scaled to `[-1, 1]`.
#[derive(Debug, Default)]
pub struct HashTextEncoder;

impl TextEncoder for HashTextEncoder {
    fn encode(&self, prompt: &str) -> anyhow::Result<Tensor> {
        let hash = blake3::hash(prompt.as_bytes());
        let bytes = hash.as_bytes();
        Ok(Tensor::from_fn(&[1, EMBED_DIM], |i| f32::from(bytes[i]) / 127.5 - 1.0))
    }
}

/// Mean of a conditioning vector: the value a sample converges to.
pub fn conditioning_target(conditioning: &Tensor) -> f32 {
    if conditioning.is_empty() {
        return 0.0;
    }
    conditioning.data().iter().sum::<f32>() / conditioning.numel() as f32
}

/// Predicts the straight-line velocity toward a flat latent at the
/// conditioning target: `(target - z) / sigma`.
#[derive(Debug, Default)]
pub struct FlatDenoiser;

impl Denoiser for FlatDenoiser {
    fn predict(&self, latent: &Tensor, sigma: f32, conditioning: &Tensor) -> anyhow::Result<Tensor> {
        anyhow::ensure!(sigma > 0.0, "sigma must be positive, got {sigma}");
        let target = conditioning_target(conditioning);
        let mut v = latent.clone();
        v.map_inplace(|z| (target - z) / sigma);
        Ok(v)
    }
}

/// Averages latent channels into RGB and upsamples ×8 by repetition.
#[derive(Debug, Default)]
pub struct NearestDecoder;

impl Decoder for NearestDecoder {
    fn decode(&self, latent: &Tensor) -> anyhow::Result<Tensor> {
        let (b, c, t, h, w) = latent.dims5()?;
        anyhow::ensure!(c > 0, "latent has no channels");
        let (oh, ow) = (h * SPATIAL_SCALE, w * SPATIAL_SCALE);
        let src = latent.data();
        let plane = t * h * w;

        Ok(Tensor::from_fn(&[b, RGB_CHANNELS, t, oh, ow], |i| {
            let x = i % ow;
            let y = (i / ow) % oh;
            let f = (i / (ow * oh)) % t;
            let batch = i / (ow * oh * t * RGB_CHANNELS);
            let at = (f * h + y / SPATIAL_SCALE) * w + x / SPATIAL_SCALE;
            let sum: f32 = (0..c).map(|ch| src[(batch * c + ch) * plane + at]).sum();
            sum / c as f32
        }))
    }
}

/// Factories for the three smoke models, usable on any rank.
pub fn factories() -> ModelFactories {
    ModelFactories {
        text_encoder: Arc::new(|_: &DeviceBinding| -> anyhow::Result<Box<dyn TextEncoder>> {
            Ok(Box::new(HashTextEncoder))
        }),
        denoiser: Arc::new(|_: &DeviceBinding| -> anyhow::Result<Box<dyn Denoiser>> {
            Ok(Box::new(FlatDenoiser))
        }),
        decoder: Arc::new(|_: &DeviceBinding| -> anyhow::Result<Box<dyn Decoder>> {
            Ok(Box::new(NearestDecoder))
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_is_deterministic_and_bounded() {
        let a = HashTextEncoder.encode("a fox in snow").unwrap();
        let b = HashTextEncoder.encode("a fox in snow").unwrap();
        let c = HashTextEncoder.encode("a cat on a roof").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.data().iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn full_step_lands_on_target() {
        let cond = Tensor::from_fn(&[1, 4], |_| 0.25);
        let z = Tensor::from_fn(&[1, 2, 1, 2, 2], |i| i as f32);
        let v = FlatDenoiser.predict(&z, 0.5, &cond).unwrap();
        // z + sigma * v == target
        for (zi, vi) in z.data().iter().zip(v.data()) {
            assert!((zi + 0.5 * vi - 0.25).abs() < 1e-6);
        }
        assert!(FlatDenoiser.predict(&z, 0.0, &cond).is_err());
    }

    #[test]
    fn decoder_averages_channels_and_upsamples() {
        // Channel 0 is 1.0, channel 1 is 3.0 everywhere.
        let z = Tensor::from_fn(&[1, 2, 2, 1, 2], |i| if i < 4 { 1.0 } else { 3.0 });
        let out = NearestDecoder.decode(&z).unwrap();
        assert_eq!(out.shape(), &[1, 3, 2, 8, 16]);
        assert!(out.data().iter().all(|&v| v == 2.0));
    }
}
