use candle_core::{DType, Tensor};

use crate::core::AttentionError;

/// Per-sequence buffers saved between decoding steps.
///
/// Every present tensor carries the batch on axis 0: keys and values are
/// `[batch, heads, src_len, head_dim]` and the padding mask `[batch, src_len]`.
#[derive(Debug, Clone, Default)]
pub struct CacheState {
    pub key_padding_mask: Option<Tensor>,
    pub buffered_keys: Option<Tensor>,
    pub buffered_values: Option<Tensor>,
}

impl CacheState {
    pub fn is_empty(&self) -> bool {
        self.key_padding_mask.is_none()
            && self.buffered_keys.is_none()
            && self.buffered_values.is_none()
    }

    /// Index-selects every present buffer along the batch axis.
    ///
    /// With `skip_matching` set, a buffer whose batch size already equals
    /// the permutation length is left alone. Encoder-decoder attention uses
    /// this since its buffers hold the static encoder output.
    pub fn reorder(&mut self, new_order: &Tensor, skip_matching: bool) -> Result<(), AttentionError> {
        let order_len = new_order
            .dims1()
            .map_err(|_| AttentionError::shape("new_order must be a 1-D index tensor"))?;
        let order = new_order.to_dtype(DType::U32)?;

        for buffer in [
            &mut self.key_padding_mask,
            &mut self.buffered_keys,
            &mut self.buffered_values,
        ] {
            let Some(tensor) = buffer.as_ref() else {
                continue;
            };
            let batch = tensor.dims().first().copied().unwrap_or(0);
            if skip_matching && batch == order_len {
                continue;
            }
            *buffer = Some(tensor.index_select(&order, 0)?);
        }
        Ok(())
    }
}

/// Merges the saved key padding mask with the current step's mask.
///
/// Masks are `[batch, len]` with nonzero marking padding. With static keys
/// the saved mask wins; two masks are concatenated along time; a lone mask is
/// padded with zeros up to `src_len` (the saved mask on the right, the
/// current one on the left). The result is `f32` whenever a concatenation
/// happens.
pub fn append_prev_key_padding_mask(
    current: Option<&Tensor>,
    previous: Option<&Tensor>,
    batch: usize,
    src_len: usize,
    static_kv: bool,
) -> Result<Option<Tensor>, AttentionError> {
    let merged = match (previous, current) {
        (Some(prev), _) if static_kv => prev.clone(),
        (Some(prev), Some(cur)) => Tensor::cat(
            &[&prev.to_dtype(DType::F32)?, &cur.to_dtype(DType::F32)?],
            1,
        )?,
        (Some(prev), None) => {
            let filler = zero_filler(prev, batch, src_len)?;
            Tensor::cat(&[&prev.to_dtype(DType::F32)?, &filler], 1)?
        }
        (None, Some(cur)) => {
            let filler = zero_filler(cur, batch, src_len)?;
            Tensor::cat(&[&filler, &cur.to_dtype(DType::F32)?], 1)?
        }
        (None, None) => return Ok(None),
    };
    Ok(Some(merged))
}

fn zero_filler(mask: &Tensor, batch: usize, src_len: usize) -> Result<Tensor, AttentionError> {
    let (_, len) = mask
        .dims2()
        .map_err(|_| AttentionError::shape("key padding masks must be [batch, len]"))?;
    if len > src_len {
        return Err(AttentionError::shape(format!(
            "key padding mask covers {len} positions but src_len is {src_len}"
        )));
    }
    Ok(Tensor::zeros((batch, src_len - len), DType::F32, mask.device())?)
}
