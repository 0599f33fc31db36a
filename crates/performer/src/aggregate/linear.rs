//! Associative aggregation in time linear in sequence length.

use std::sync::OnceLock;

use candle_core::{Tensor, D};

use crate::aggregate::{clamp_min, validate_operands, NORMALIZER_EPS};
use crate::core::{AttentionError, FeatureAttention};
use crate::masks::normalize_additive_mask;

/// Computes `q'·(k'ᵗ·V) / (q'·Σₙ k'ₙ)` without forming the score matrix.
///
/// Position-wise masks cannot be expressed in this factorization. A mask is
/// shape-checked and then ignored, with a warning on first use; padded keys
/// are handled upstream by zeroing their features.
#[derive(Debug)]
pub struct LinearAggregation {
    pub eps: f64,
    mask_warned: OnceLock<()>,
}

impl LinearAggregation {
    pub fn new(eps: f64) -> Self {
        Self {
            eps,
            mask_warned: OnceLock::new(),
        }
    }
}

impl Default for LinearAggregation {
    fn default() -> Self {
        Self::new(NORMALIZER_EPS)
    }
}

impl FeatureAttention for LinearAggregation {
    fn attend(
        &self,
        q_prime: &Tensor,
        k_prime: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        let (batch, heads, q_len, k_len) = validate_operands(q_prime, k_prime, v)?;
        if let Some(mask) = mask {
            normalize_additive_mask(mask, batch, heads, q_len, k_len)?;
            if self.mask_warned.set(()).is_ok() {
                log::warn!(
                    "linear aggregation ignores attention masks; use the causal path to enforce them"
                );
            }
        }

        // (B, H, M, D)
        let kv = k_prime.transpose(2, 3)?.contiguous()?.matmul(&v.contiguous()?)?;
        let qkv = q_prime.matmul(&kv)?;

        // (B, H, 1, M) -> (B, H, N, 1)
        let k_sum = k_prime.sum_keepdim(2)?;
        let normalizer = q_prime.broadcast_mul(&k_sum)?.sum_keepdim(D::Minus1)?;
        let normalizer = clamp_min(&normalizer, self.eps)?;

        Ok(qkv.broadcast_div(&normalizer)?)
    }
}
