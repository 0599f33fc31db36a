//! Parameter records and checkpoint compatibility.
//!
//! A checkpoint is a flat `name -> tensor` map persisted as safetensors.
//! Current checkpoints carry one weight (and optional bias) per projection
//! under `q_proj`, `k_proj`, `v_proj` and `out_proj`, plus the cached
//! evaluation projection under [`EVAL_PROJECTION_KEY`]. Older checkpoints
//! stored query, key and value as a single fused blob; [`legacy`] migrates
//! them.

pub mod legacy;

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::core::AttentionError;

pub use legacy::{upgrade_state_dict_named, LegacyAttentionRecord};

/// Key under which the evaluation-mode projection matrix is stored.
pub const EVAL_PROJECTION_KEY: &str = "eval_proj";

/// Weight and optional bias of one affine projection.
#[derive(Debug, Clone)]
pub struct LinearRecord {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl LinearRecord {
    pub(crate) fn insert_into(&self, map: &mut HashMap<String, Tensor>, prefix: &str) {
        map.insert(format!("{prefix}.weight"), self.weight.clone());
        if let Some(bias) = &self.bias {
            map.insert(format!("{prefix}.bias"), bias.clone());
        }
    }

    /// Reads `{prefix}.weight` and `{prefix}.bias`; `None` when no weight is present.
    pub(crate) fn take_from(map: &mut HashMap<String, Tensor>, prefix: &str) -> Option<Self> {
        let weight = map.remove(&format!("{prefix}.weight"))?;
        let bias = map.remove(&format!("{prefix}.bias"));
        Some(Self { weight, bias })
    }
}

/// Separated query, key and value projections in the current layout.
#[derive(Debug, Clone)]
pub struct AttentionRecord {
    pub q_proj: LinearRecord,
    pub k_proj: LinearRecord,
    pub v_proj: LinearRecord,
}

impl AttentionRecord {
    pub fn into_state_dict(self, prefix: &str) -> HashMap<String, Tensor> {
        let mut map = HashMap::new();
        for (name, record) in [
            ("q_proj", &self.q_proj),
            ("k_proj", &self.k_proj),
            ("v_proj", &self.v_proj),
        ] {
            record.insert_into(&mut map, &format!("{prefix}{name}"));
        }
        map
    }
}

/// Writes `tensors` to `path` in safetensors format.
pub fn save_state_dict(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<(), AttentionError> {
    if tensors.is_empty() {
        return Err(AttentionError::config("state dict contains no tensors to save"));
    }
    candle_core::safetensors::save(tensors, path)?;
    Ok(())
}

/// Reads a safetensors file into a state dict on `device`.
pub fn load_state_dict(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>, AttentionError> {
    Ok(candle_core::safetensors::load(path, device)?)
}
