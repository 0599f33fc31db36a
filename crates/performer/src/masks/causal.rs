//! Builders for causal attention masks.

use candle_core::{Device, Result, Tensor};

use super::MASK_DTYPE;

/// Construct an additive causal mask shaped `[batch, num_heads, q_len, k_len]`.
///
/// Entries are `0.0` where attention is permitted and `f32::NEG_INFINITY`
/// otherwise. When `k_len > q_len`, queries align with the most recent
/// `q_len` keys, so the extra prefix stays visible.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let row: Vec<f32> = (0..q_len)
        .flat_map(|q| {
            (0..k_len).map(move |k| if k > q + offset { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();

    Tensor::from_vec(row, (1, 1, q_len, k_len), device)?
        .to_dtype(MASK_DTYPE)?
        .broadcast_as((batch, num_heads, q_len, k_len))?
        .contiguous()
}
