//! Kernelized aggregation of values from random features.
//!
//! Two interchangeable strategies implement [`FeatureAttention`]:
//!
//! * [`CausalAggregation`] materializes the `(N, N)` score matrix `q'·k'ᵗ`,
//!   applies an additive mask in kernel space and row-normalizes. Cost
//!   `O(N²M)`; any position-wise mask is enforced exactly.
//! * [`LinearAggregation`] contracts keys with values first (`k'ᵗ·V`) and
//!   never forms the score matrix. Cost `O(N·M·D)`.
//!
//! Every denominator is clamped to at least [`NORMALIZER_EPS`], so rows with
//! no admissible keys come out as bounded zeros instead of NaN.

pub mod causal;
pub mod linear;

use candle_core::Tensor;

use crate::core::{AttentionError, FeatureAttention};

pub use causal::CausalAggregation;
pub use linear::LinearAggregation;

/// Lower bound applied to row sums and normalizers before division.
pub const NORMALIZER_EPS: f64 = 1e-2;

/// Returns the aggregation strategy selected by the `causal` flag.
pub fn select(causal: bool) -> Box<dyn FeatureAttention> {
    if causal {
        Box::new(CausalAggregation::default())
    } else {
        Box::new(LinearAggregation::default())
    }
}

/// Checks `q'`, `k'`, `v` against each other, returning `(batch, heads, q_len, k_len)`.
pub(crate) fn validate_operands(
    q_prime: &Tensor,
    k_prime: &Tensor,
    v: &Tensor,
) -> Result<(usize, usize, usize, usize), AttentionError> {
    let (batch, heads, q_len, features) = q_prime
        .dims4()
        .map_err(|_| AttentionError::shape("q' must be [batch, heads, q_len, features]"))?;
    let (kb, kh, k_len, kf) = k_prime
        .dims4()
        .map_err(|_| AttentionError::shape("k' must be [batch, heads, k_len, features]"))?;
    let (vb, vh, vk, _) = v
        .dims4()
        .map_err(|_| AttentionError::shape("v must be [batch, heads, k_len, head_dim]"))?;

    if kb != batch || kh != heads || kf != features {
        return Err(AttentionError::shape(format!(
            "k' shape mismatch: expected [{batch}, {heads}, ?, {features}] got [{kb}, {kh}, {k_len}, {kf}]"
        )));
    }
    if vb != batch || vh != heads || vk != k_len {
        return Err(AttentionError::shape(format!(
            "v shape mismatch: expected [{batch}, {heads}, {k_len}, ?] got {:?}",
            v.dims()
        )));
    }
    Ok((batch, heads, q_len, k_len))
}

/// `max(tensor, min)` elementwise, matching the tensor's dtype.
pub(crate) fn clamp_min(tensor: &Tensor, min: f64) -> candle_core::Result<Tensor> {
    let floor = Tensor::new(min, tensor.device())?
        .to_dtype(tensor.dtype())?
        .broadcast_as(tensor.shape())?;
    tensor.maximum(&floor)
}
