//! Key padding masks.
//!
//! Padding is expressed on the key side as `[batch, src_len]` with nonzero
//! entries marking padded positions. Kernelized attention cannot add `-inf`
//! to scores it never materializes, so padding is enforced by zeroing the
//! padded rows of `k'` instead.

use candle_core::{DType, Device, Tensor};

use crate::core::AttentionError;

/// Converts a `[batch, src_len]` padding mask into a `[batch, 1, src_len, 1]`
/// keep factor (`1.0` for real keys, `0.0` for padding) in `dtype`.
pub fn key_padding_keep(
    mask: &Tensor,
    batch: usize,
    src_len: usize,
    dtype: DType,
) -> Result<Tensor, AttentionError> {
    let (b, n) = mask
        .dims2()
        .map_err(|_| AttentionError::shape("key_padding_mask must be [batch, src_len]"))?;
    if b != batch || n != src_len {
        return Err(AttentionError::shape(format!(
            "key_padding_mask is [{b}, {n}] but keys are [{batch}, {src_len}]"
        )));
    }

    let padded = mask.to_dtype(DType::F32)?.ne(0f64)?;
    let keep = padded.to_dtype(DType::F32)?.affine(-1.0, 1.0)?;
    Ok(keep.reshape((batch, 1, src_len, 1))?.to_dtype(dtype)?)
}

/// Builds a `[batch, src_len]` `u8` padding mask from per-batch valid lengths.
pub fn key_padding_from_lengths(
    device: &Device,
    lengths: &[usize],
    src_len: usize,
) -> candle_core::Result<Tensor> {
    let data: Vec<u8> = lengths
        .iter()
        .flat_map(|&valid| (0..src_len).map(move |k| u8::from(k >= valid)))
        .collect();
    Tensor::from_vec(data, (lengths.len(), src_len), device)
}
