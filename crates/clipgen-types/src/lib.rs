pub mod config;
pub mod error;
pub mod model;
pub mod request;
pub mod tensor;

pub use error::{ClipgenError, TensorError};
pub use model::{DeviceBinding, ModelComponent, ModelFile, ShardDescriptor, ShardManifest};
pub use request::{GenerationRequest, InferenceRequest, InferenceResult};
pub use tensor::Tensor;
