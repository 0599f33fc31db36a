//! Explicit-score aggregation with exact position-wise masking.

use candle_core::{Tensor, D};

use crate::aggregate::{clamp_min, validate_operands, NORMALIZER_EPS};
use crate::core::{AttentionError, FeatureAttention};
use crate::masks::normalize_additive_mask;

/// Builds `q'·k'ᵗ`, weights it by `exp(mask)` and row-normalizes.
///
/// An additive entry of `-inf` (or any large negative value) becomes a zero
/// weight, and `0` leaves the score untouched, which mirrors what the same
/// mask does to softmax logits.
#[derive(Debug, Clone, Copy)]
pub struct CausalAggregation {
    pub eps: f64,
}

impl Default for CausalAggregation {
    fn default() -> Self {
        Self {
            eps: NORMALIZER_EPS,
        }
    }
}

impl FeatureAttention for CausalAggregation {
    fn attend(
        &self,
        q_prime: &Tensor,
        k_prime: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        let (batch, heads, q_len, k_len) = validate_operands(q_prime, k_prime, v)?;

        let mut weights = q_prime.matmul(&k_prime.transpose(2, 3)?.contiguous()?)?;
        if let Some(mask) = mask {
            let mask = normalize_additive_mask(mask, batch, heads, q_len, k_len)?;
            let keep = mask.to_dtype(weights.dtype())?.exp()?;
            weights = weights.broadcast_mul(&keep)?;
        }

        let denom = clamp_min(&weights.sum_keepdim(D::Minus1)?, self.eps)?;
        let attn_weights = weights.broadcast_div(&denom)?;
        Ok(attn_weights.matmul(&v.contiguous()?)?)
    }
}
