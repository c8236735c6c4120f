//! `clipgen-ops` — tensor kernels used on every rank.
//!
//! - [`pack`]: merge two token streams into one packed buffer by index, and
//!   split it back.
//! - [`tiling`]: decode a latent volume in overlapping spatial tiles and
//!   temporal batches, cross-fading the seams.
//! - [`normalize`]: map decoder output to `[0, 1]` and to 8-bit frames.

pub mod error;
pub mod normalize;
pub mod pack;
pub mod tiling;

pub use error::{OpsError, Result};
pub use normalize::{frames_to_rgb8, normalize_frames, RgbFrames};
pub use pack::PackKernel;
pub use tiling::{decode_tiled, Decoder, TileGeometry};
