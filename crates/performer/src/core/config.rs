//! Configuration options for performer attention.
//!
//! [`PerformerConfig`] captures the model geometry, the random-feature budget
//! and the pass-through knobs for the surrounding projections. It can be
//! built in code, read from a `.json`/`.toml` file, and nudged through
//! environment variables.

use std::{env, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::core::AttentionError;

const ENV_APPROX_ATTN_DIM: &str = "PERFORMER_APPROX_ATTN_DIM";
const ENV_CAUSAL: &str = "PERFORMER_CAUSAL";
const ENV_SEED: &str = "PERFORMER_SEED";

fn default_approx_attn_dim() -> usize {
    64
}

fn default_bias() -> bool {
    true
}

fn default_qn_block_size() -> usize {
    8
}

/// Configuration driving a [`PerformerAttention`](crate::PerformerAttention) module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformerConfig {
    /// Total model width; input and output last dimension.
    pub d_model: usize,
    /// Number of attention heads; must divide `d_model`.
    pub n_heads: usize,
    /// Number of random features `M` per head.
    #[serde(default = "default_approx_attn_dim")]
    pub approx_attn_dim: usize,
    /// Selects the explicit-score causal aggregation instead of the linear one.
    #[serde(default)]
    pub causal: bool,
    /// Dropout on the merged attention output, training only.
    #[serde(default)]
    pub dropout: f32,
    /// Whether the projections carry a bias.
    #[serde(default = "default_bias")]
    pub bias: bool,
    /// Block-wise weight noise probability for the projections, training only.
    #[serde(default)]
    pub q_noise: f32,
    /// Block size for `q_noise`.
    #[serde(default = "default_qn_block_size")]
    pub qn_block_size: usize,
    /// Keys and values come from an encoder; affects cache reordering.
    #[serde(default)]
    pub encoder_decoder_attention: bool,
    /// Base seed for evaluation and training projection draws.
    #[serde(default)]
    pub seed: u64,
}

impl PerformerConfig {
    /// Creates a configuration with default feature budget and knobs.
    pub fn new(d_model: usize, n_heads: usize) -> Self {
        Self {
            d_model,
            n_heads,
            approx_attn_dim: default_approx_attn_dim(),
            causal: false,
            dropout: 0.0,
            bias: default_bias(),
            q_noise: 0.0,
            qn_block_size: default_qn_block_size(),
            encoder_decoder_attention: false,
            seed: 0,
        }
    }

    /// Per-head dimension `D = d_model / n_heads`.
    pub fn head_dim(&self) -> usize {
        if self.n_heads == 0 {
            0
        } else {
            self.d_model / self.n_heads
        }
    }

    /// Reads a configuration from a JSON or TOML file and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AttentionError> {
        let path = path.as_ref();
        let file_error = |message: String| AttentionError::ConfigFile {
            path: path.to_path_buf(),
            message,
        };
        let contents = fs::read_to_string(path).map_err(|err| file_error(err.to_string()))?;
        let config: PerformerConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => {
                serde_json::from_str(&contents).map_err(|err| file_error(err.to_string()))?
            }
            Some("toml") => toml::from_str(&contents).map_err(|err| file_error(err.to_string()))?,
            other => {
                return Err(file_error(format!(
                    "unsupported configuration extension {other:?}"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, then layers `PERFORMER_*` environment overrides on top
    /// before validating.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AttentionError> {
        let mut config = Self::from_path(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies `PERFORMER_*` environment overrides; malformed values are skipped.
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = read_env::<usize>(ENV_APPROX_ATTN_DIM) {
            self.approx_attn_dim = value;
        }
        if let Some(value) = read_flag(ENV_CAUSAL) {
            self.causal = value;
        }
        if let Some(value) = read_env::<u64>(ENV_SEED) {
            self.seed = value;
        }
    }

    /// Checks structural invariants; violations are fatal at construction.
    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.d_model == 0 {
            return Err(AttentionError::config("d_model must be greater than zero"));
        }
        if self.n_heads == 0 {
            return Err(AttentionError::config("n_heads must be greater than zero"));
        }
        if self.d_model % self.n_heads != 0 {
            return Err(AttentionError::config(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                self.d_model, self.n_heads
            )));
        }
        if self.approx_attn_dim == 0 {
            return Err(AttentionError::config(
                "approx_attn_dim must be greater than zero",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(AttentionError::config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(0.0..1.0).contains(&self.q_noise) {
            return Err(AttentionError::config(format!(
                "q_noise must be in [0, 1), got {}",
                self.q_noise
            )));
        }
        if self.q_noise > 0.0 && (self.qn_block_size == 0 || self.d_model % self.qn_block_size != 0)
        {
            return Err(AttentionError::config(format!(
                "qn_block_size ({}) must divide d_model ({}) when q_noise is enabled",
                self.qn_block_size, self.d_model
            )));
        }
        Ok(())
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring malformed {key}={raw:?}");
            None
        }
    }
}

fn read_flag(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            log::warn!("ignoring malformed {key}={raw:?}");
            None
        }
    }
}
