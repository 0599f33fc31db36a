//! Mask utilities for kernelized attention.
//!
//! Two kinds of masks flow through the module:
//!
//! * additive position masks (`0.0` keep, `-inf` or a large negative value
//!   discard) that only the causal aggregation can honour, and
//! * key padding masks of shape `[batch, src_len]`, nonzero where a key is
//!   padding, which are turned into multiplicative keep factors on `k'`.

pub mod causal;
pub mod padding;

use candle_core::{DType, Tensor};

use crate::core::AttentionError;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::build_causal_mask;
pub use padding::{key_padding_from_lengths, key_padding_keep};

/// Brings an additive mask into a shape that broadcasts against
/// `[batch, heads, q_len, k_len]` scores.
///
/// Accepted layouts are `[q_len, k_len]`, `[batch * heads, q_len, k_len]`,
/// `[1, q_len, k_len]` and `[batch | 1, heads | 1, q_len, k_len]`.
pub fn normalize_additive_mask(
    mask: &Tensor,
    batch: usize,
    heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor, AttentionError> {
    let dims = mask.dims();
    let mismatch = || {
        AttentionError::shape(format!(
            "attention mask {dims:?} does not broadcast to [{batch}, {heads}, {q_len}, {k_len}]"
        ))
    };

    let shaped = match *dims {
        [q, k] if q == q_len && k == k_len => mask.reshape((1, 1, q_len, k_len))?,
        [1, q, k] if q == q_len && k == k_len => mask.reshape((1, 1, q_len, k_len))?,
        [bh, q, k] if bh == batch * heads && q == q_len && k == k_len => {
            mask.reshape((batch, heads, q_len, k_len))?
        }
        [b, h, q, k]
            if (b == batch || b == 1)
                && (h == heads || h == 1)
                && q == q_len
                && k == k_len =>
        {
            mask.clone()
        }
        _ => return Err(mismatch()),
    };
    Ok(shaped.to_dtype(MASK_DTYPE)?)
}
