//! Random projection matrices for FAVOR+ features.
//!
//! A projection has shape `(heads, features, head_dim)`. Unstructured
//! projections are i.i.d. standard normal draws. Orthogonal projections stack
//! `ceil(features / head_dim)` orthogonal blocks per head, truncate to
//! `features` rows and rescale each row by an independent chi-distributed
//! norm, so row lengths match the unstructured case while rows within a block
//! stay orthogonal.

use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::core::AttentionError;
use crate::projection::orthogonal::sample_orthogonal_block;

/// Seed distance between heads of an orthogonal projection.
pub const HEAD_SEED_STRIDE: u64 = 1000;

/// Builder for `(heads, features, head_dim)` projection tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionBuilder {
    pub heads: usize,
    pub features: usize,
    pub head_dim: usize,
    pub orthogonal: bool,
}

impl ProjectionBuilder {
    /// Unstructured Gaussian projection builder.
    pub fn new(heads: usize, features: usize, head_dim: usize) -> Self {
        Self {
            heads,
            features,
            head_dim,
            orthogonal: false,
        }
    }

    /// Switches between orthogonal and unstructured draws.
    pub fn orthogonal(mut self, orthogonal: bool) -> Self {
        self.orthogonal = orthogonal;
        self
    }

    /// Draws the projection from `seed`, computing in `f64` and casting to `dtype`.
    pub fn build(&self, seed: u64, device: &Device, dtype: DType) -> Result<Tensor, AttentionError> {
        if self.heads == 0 || self.features == 0 || self.head_dim == 0 {
            return Err(AttentionError::config(format!(
                "projection dimensions must be non-zero, got ({}, {}, {})",
                self.heads, self.features, self.head_dim
            )));
        }

        let data = if self.orthogonal {
            let mut data = Vec::with_capacity(self.heads * self.features * self.head_dim);
            for head in 0..self.heads {
                let head_seed = seed.wrapping_add(head as u64 * HEAD_SEED_STRIDE);
                let mut rng = StdRng::seed_from_u64(head_seed);
                data.extend(gaussian_orthogonal_rows(self.features, self.head_dim, &mut rng)?);
            }
            data
        } else {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..self.heads * self.features * self.head_dim)
                .map(|_| rng.sample::<f64, _>(StandardNormal))
                .collect()
        };

        let tensor = Tensor::from_vec(data, (self.heads, self.features, self.head_dim), device)?;
        Ok(tensor.to_dtype(dtype)?)
    }
}

/// One head's `(rows, cols)` block-orthogonal matrix with chi-scaled rows.
fn gaussian_orthogonal_rows<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    rng: &mut R,
) -> Result<Vec<f64>, AttentionError> {
    let mut stacked = Vec::with_capacity(rows * cols);
    let mut remaining = rows;
    while remaining > 0 {
        let block = sample_orthogonal_block(cols, rng)?;
        let take = remaining.min(cols);
        stacked.extend_from_slice(&block[..take * cols]);
        remaining -= take;
    }

    for row in stacked.chunks_mut(cols) {
        let multiplier = (0..cols)
            .map(|_| rng.sample::<f64, _>(StandardNormal).powi(2))
            .sum::<f64>()
            .sqrt();
        for value in row.iter_mut() {
            *value *= multiplier;
        }
    }
    Ok(stacked)
}
