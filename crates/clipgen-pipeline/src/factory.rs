//! Model collaborators and the factories that build them on a rank.
//!
//! The pipeline never looks inside a model. A factory receives the rank's
//! [`DeviceBinding`] and may load full weights or only that rank's shard; it
//! just has to hand back something ready to evaluate.

use std::sync::Arc;

use clipgen_types::{DeviceBinding, Tensor};

pub use clipgen_ops::Decoder;

/// Prompt → conditioning embedding.
pub trait TextEncoder: Send {
    fn encode(&self, prompt: &str) -> anyhow::Result<Tensor>;
}

/// Velocity prediction for the flow-matching sampler.
pub trait Denoiser: Send {
    fn predict(&self, latent: &Tensor, sigma: f32, conditioning: &Tensor) -> anyhow::Result<Tensor>;
}

pub trait ModelFactory<M>: Send + Sync {
    fn get_model(&self, binding: &DeviceBinding) -> anyhow::Result<M>;
}

impl<M, F> ModelFactory<M> for F
where
    F: Fn(&DeviceBinding) -> anyhow::Result<M> + Send + Sync,
{
    fn get_model(&self, binding: &DeviceBinding) -> anyhow::Result<M> {
        self(binding)
    }
}

pub type TextEncoderFactory = Arc<dyn ModelFactory<Box<dyn TextEncoder>>>;
pub type DenoiserFactory = Arc<dyn ModelFactory<Box<dyn Denoiser>>>;
pub type DecoderFactory = Arc<dyn ModelFactory<Box<dyn Decoder>>>;

/// One factory per component, shared by every rank.
#[derive(Clone)]
pub struct ModelFactories {
    pub text_encoder: TextEncoderFactory,
    pub denoiser: DenoiserFactory,
    pub decoder: DecoderFactory,
}
