//! Affine building blocks that sit around the attention core.
//!
//! Query, key, value and output projections are ordinary linear maps; this
//! crate owns them together with the precision policy that decides which
//! dtype matmuls and reductions run in, plus small shape assertions shared by
//! the attention crate.

pub mod checks;
pub mod dtypes;
pub mod linear;

use thiserror::Error;

pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit, QuantNoise};

/// Errors raised while configuring layers.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Quantization noise was requested with a block size that does not tile
    /// the input features.
    #[error("q-noise block size {block_size} must divide input_dim {input_dim}")]
    QuantNoiseBlock { input_dim: usize, block_size: usize },
    /// Quantization noise probability outside `[0, 1)`.
    #[error("q-noise probability must be in [0, 1), got {0}")]
    QuantNoiseProbability(f32),
    /// Tensor backend failure while building parameters.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}
