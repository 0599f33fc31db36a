//! Migration of fused query/key/value checkpoints.
//!
//! Old checkpoints stored `in_proj_weight` shaped `(3·d, d)` and
//! `in_proj_bias` shaped `(3·d,)`, with query, key and value stacked in that
//! order along the first axis. Migration splits them into three equal
//! chunks. It runs once at load time and never on the forward path.

use std::collections::HashMap;

use candle_core::Tensor;

use super::{AttentionRecord, LinearRecord};
use crate::core::AttentionError;

const FUSED_WEIGHT: &str = "in_proj_weight";
const FUSED_BIAS: &str = "in_proj_bias";

/// Fused projection parameters as found in old checkpoints.
#[derive(Debug, Clone)]
pub struct LegacyAttentionRecord {
    pub in_proj_weight: Tensor,
    pub in_proj_bias: Option<Tensor>,
}

impl LegacyAttentionRecord {
    /// Splits the fused blob into query, key and value records.
    pub fn migrate(self) -> Result<AttentionRecord, AttentionError> {
        let rows = self.in_proj_weight.dims().first().copied().unwrap_or(0);
        let [q_w, k_w, v_w] = split_in_three(&self.in_proj_weight, FUSED_WEIGHT)?;

        let [q_b, k_b, v_b] = match &self.in_proj_bias {
            Some(bias) => {
                let len = bias.dims1().map_err(|_| {
                    AttentionError::legacy(FUSED_BIAS, format!("expected a vector, got {:?}", bias.dims()))
                })?;
                if len != rows {
                    return Err(AttentionError::legacy(
                        FUSED_BIAS,
                        format!("has {len} entries but the fused weight has {rows} rows"),
                    ));
                }
                split_in_three(bias, FUSED_BIAS)?.map(Some)
            }
            None => [None, None, None],
        };

        Ok(AttentionRecord {
            q_proj: LinearRecord { weight: q_w, bias: q_b },
            k_proj: LinearRecord { weight: k_w, bias: k_b },
            v_proj: LinearRecord { weight: v_w, bias: v_b },
        })
    }
}

fn split_in_three(tensor: &Tensor, key: &str) -> Result<[Tensor; 3], AttentionError> {
    let rows = match tensor.dims().first() {
        Some(&rows) if rows > 0 && rows % 3 == 0 => rows,
        _ => {
            return Err(AttentionError::legacy(
                key,
                format!("leading dimension of {:?} is not a positive multiple of 3", tensor.dims()),
            ))
        }
    };
    let dim = rows / 3;
    Ok([
        tensor.narrow(0, 0, dim)?,
        tensor.narrow(0, dim, dim)?,
        tensor.narrow(0, 2 * dim, dim)?,
    ])
}

/// Rewrites fused entries of `state_dict` under module `name` in place.
///
/// Every key ending in `{name}.in_proj_weight` (or `in_proj_weight` when
/// `name` is empty) is replaced by the split `q_proj`/`k_proj`/`v_proj`
/// entries next to it, together with its `in_proj_bias` sibling when
/// present. Returns how many fused blobs were migrated.
pub fn upgrade_state_dict_named(
    state_dict: &mut HashMap<String, Tensor>,
    name: &str,
) -> Result<usize, AttentionError> {
    let suffix = if name.is_empty() {
        FUSED_WEIGHT.to_string()
    } else {
        format!("{name}.{FUSED_WEIGHT}")
    };

    let mut fused_keys: Vec<String> = state_dict
        .keys()
        .filter(|key| key.ends_with(&suffix))
        .cloned()
        .collect();
    fused_keys.sort();

    for key in &fused_keys {
        let stem = key.strip_suffix(FUSED_WEIGHT).unwrap_or_default().to_string();
        let bias_key = format!("{stem}{FUSED_BIAS}");

        let Some(in_proj_weight) = state_dict.get(key).cloned() else {
            continue;
        };
        let legacy = LegacyAttentionRecord {
            in_proj_weight,
            in_proj_bias: state_dict.get(&bias_key).cloned(),
        };
        let record = legacy.migrate()?;

        state_dict.remove(key);
        state_dict.remove(&bias_key);
        state_dict.extend(record.into_state_dict(&stem));
        log::info!("split legacy fused projection {key} into {stem}{{q,k,v}}_proj");
    }

    Ok(fused_keys.len())
}
