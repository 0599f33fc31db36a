//! Multi-head FAVOR+ attention.
//!
//! [`PerformerAttention`] projects a `(batch, seq, d_model)` input to queries,
//! keys and values, splits them into heads, maps queries and keys to random
//! features, aggregates values with the causal or linear strategy and merges
//! the heads back through the output projection.
//!
//! The module has two modes. In training mode every forward call draws a
//! fresh unstructured Gaussian projection. In evaluation mode a single
//! orthogonal projection is built on first use and reused until
//! [`PerformerAttention::refresh_eval_projection`] is called.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use candle_core::{DType, Device, Tensor};
use candle_nn::ops::dropout;
use layers::{Linear, LinearConfig, LinearInit, PrecisionPolicy, QuantNoise};

use crate::aggregate;
use crate::checkpoint::{self, LinearRecord, EVAL_PROJECTION_KEY};
use crate::core::{AttentionError, FeatureAttention, PerformerConfig};
use crate::features::{key_features, query_features};
use crate::incremental::CacheState;
use crate::masks::{build_causal_mask, key_padding_keep};
use crate::projection::ProjectionBuilder;

const SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

const PROJECTION_NAMES: [&str; 4] = ["q_proj", "k_proj", "v_proj", "out_proj"];

/// Self-attention layer with a linear-time softmax kernel approximation.
pub struct PerformerAttention {
    config: PerformerConfig,
    policy: PrecisionPolicy,
    device: Device,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    aggregation: Box<dyn FeatureAttention>,
    training: bool,
    eval_seed: u64,
    eval_proj: OnceLock<Tensor>,
    eval_init: Mutex<()>,
    draws: AtomicU64,
}

impl std::fmt::Debug for PerformerAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformerAttention")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("training", &self.training)
            .field("eval_seed", &self.eval_seed)
            .field("eval_proj_built", &self.eval_proj.get().is_some())
            .finish()
    }
}

impl PerformerAttention {
    /// Builds the layer with freshly initialised projections stored in `dtype`.
    ///
    /// The layer starts in training mode.
    pub fn new(config: PerformerConfig, device: &Device, dtype: DType) -> Result<Self, AttentionError> {
        config.validate()?;
        let policy = PrecisionPolicy::from_parameter_dtype(dtype);

        let build_linear = || -> Result<Linear, AttentionError> {
            let mut linear_cfg = LinearConfig::new(config.d_model, config.d_model);
            linear_cfg.bias = config.bias;
            let noise = QuantNoise::new(config.q_noise, config.qn_block_size, config.d_model)?;
            Ok(Linear::with_init(linear_cfg, &LinearInit::fan_in_uniform(), device, dtype)?
                .with_quant_noise(noise))
        };

        let layer = Self {
            q_proj: build_linear()?,
            k_proj: build_linear()?,
            v_proj: build_linear()?,
            out_proj: build_linear()?,
            aggregation: aggregate::select(config.causal),
            policy,
            device: device.clone(),
            training: true,
            eval_seed: config.seed,
            eval_proj: OnceLock::new(),
            eval_init: Mutex::new(()),
            draws: AtomicU64::new(0),
            config,
        };

        log::info!(
            "performer attention d_model={} heads={} head_dim={} approx_attn_dim={} causal={}",
            layer.config.d_model,
            layer.config.n_heads,
            layer.config.head_dim(),
            layer.config.approx_attn_dim,
            layer.config.causal
        );
        Ok(layer)
    }

    pub fn config(&self) -> &PerformerConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// The cached orthogonal projection used in evaluation mode.
    ///
    /// Built once on first use; concurrent first callers wait for the single
    /// construction and then share its result.
    pub fn eval_projection(&self) -> Result<Tensor, AttentionError> {
        if let Some(projection) = self.eval_proj.get() {
            return Ok(projection.clone());
        }

        let _guard = self
            .eval_init
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(projection) = self.eval_proj.get() {
            return Ok(projection.clone());
        }

        let projection = self
            .projection_builder()
            .orthogonal(true)
            .build(self.eval_seed, &self.device, self.policy.reduction())?;
        log::info!(
            "built evaluation projection {:?} from seed {}",
            projection.dims(),
            self.eval_seed
        );
        Ok(self.eval_proj.get_or_init(|| projection).clone())
    }

    /// Drops the cached evaluation projection and picks a new seed for it.
    pub fn refresh_eval_projection(&mut self) {
        self.eval_seed = self.next_seed();
        self.eval_proj = OnceLock::new();
    }

    /// Runs self-attention over `query` shaped `(batch, seq, d_model)`.
    ///
    /// `key_padding_mask` is `(batch, seq)`, nonzero at padded keys.
    /// `attn_mask` is an additive mask (see
    /// [`normalize_additive_mask`](crate::masks::normalize_additive_mask)).
    /// Only the causal aggregation enforces it; non-causal layers check its
    /// shape and ignore it. Causal layers without an explicit mask use a
    /// strict causal mask. The second element of the result is
    /// always `None` since attention weights are never materialized.
    pub fn forward(
        &self,
        query: &Tensor,
        key_padding_mask: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>), AttentionError> {
        let (batch, seq, hidden) = query
            .dims3()
            .map_err(|_| AttentionError::shape("query must be [batch, seq, d_model]"))?;
        if hidden != self.config.d_model {
            return Err(AttentionError::shape(format!(
                "query hidden size {hidden} does not match d_model {}",
                self.config.d_model
            )));
        }

        let q = self.split_heads(&self.q_proj.forward_t(query, &self.policy, self.training)?)?;
        let k = self.split_heads(&self.k_proj.forward_t(query, &self.policy, self.training)?)?;
        let v = self.split_heads(&self.v_proj.forward_t(query, &self.policy, self.training)?)?;

        let projection = if self.training {
            self.training_projection()?
        } else {
            self.eval_projection()?
        };
        let q_prime = query_features(&q, &projection)?;
        let k_prime = match key_padding_mask {
            // Padded keys are zeroed before the feature map, so their values
            // cannot inflate the key stabilizer (a zeroed key still enters the
            // max with a score of 0). Their features are zeroed after.
            Some(mask) => {
                let keep = key_padding_keep(mask, batch, seq, k.dtype())?;
                key_features(&k.broadcast_mul(&keep)?, &projection)?.broadcast_mul(&keep)?
            }
            None => key_features(&k, &projection)?,
        };

        let causal_mask;
        let mask = match (self.config.causal, attn_mask) {
            (true, None) => {
                causal_mask = build_causal_mask(query.device(), 1, 1, seq, seq)?;
                Some(&causal_mask)
            }
            (_, mask) => mask,
        };
        let output = self.aggregation.attend(&q_prime, &k_prime, &v, mask)?;

        let merged = output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, self.config.d_model))?;
        let mut merged = self.policy.cast_to_storage(&merged)?;
        if self.training && self.config.dropout > 0.0 {
            merged = dropout(&merged, self.config.dropout)?;
        }

        let output = self.out_proj.forward_t(&merged, &self.policy, self.training)?;
        Ok((output, None))
    }

    /// Permutes buffered decoding state along the batch axis. No state is a no-op.
    pub fn reorder_incremental_state(
        &self,
        state: &mut Option<CacheState>,
        new_order: &Tensor,
    ) -> Result<(), AttentionError> {
        if let Some(state) = state.as_mut() {
            state.reorder(new_order, self.config.encoder_decoder_attention)?;
        }
        Ok(())
    }

    /// Current parameters keyed by name, including the evaluation projection
    /// once it has been built.
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        let mut map = HashMap::new();
        for (name, layer) in PROJECTION_NAMES.iter().zip(self.projections()) {
            LinearRecord {
                weight: layer.weight(),
                bias: layer.bias(),
            }
            .insert_into(&mut map, name);
        }
        if let Some(projection) = self.eval_proj.get() {
            map.insert(EVAL_PROJECTION_KEY.to_string(), projection.clone());
        }
        map
    }

    /// Loads parameters produced by [`Self::state_dict`] or by an older
    /// checkpoint with fused query/key/value projections.
    ///
    /// Every projection weight must be present and no unknown key may
    /// remain. An `eval_proj` entry replaces the cached evaluation projection.
    /// The layer is only modified once the whole checkpoint has been
    /// accepted; on error it keeps its previous parameters.
    pub fn load_state_dict(&mut self, mut state: HashMap<String, Tensor>) -> Result<(), AttentionError> {
        checkpoint::upgrade_state_dict_named(&mut state, "")?;

        let mut staged = self.projections().map(Linear::clone);
        for (name, layer) in PROJECTION_NAMES.iter().zip(staged.iter_mut()) {
            let record = LinearRecord::take_from(&mut state, name).ok_or_else(|| {
                AttentionError::config(format!("checkpoint missing parameter {name}.weight"))
            })?;
            layer.load_weight(&record.weight)?;
            if let Some(bias) = &record.bias {
                layer.load_bias(bias)?;
            }
        }

        let eval_proj = match state.remove(EVAL_PROJECTION_KEY) {
            Some(projection) => {
                let expected = [
                    self.config.n_heads,
                    self.config.approx_attn_dim,
                    self.config.head_dim(),
                ];
                if projection.dims() != expected {
                    return Err(AttentionError::shape(format!(
                        "eval_proj is {:?}, expected {expected:?}",
                        projection.dims()
                    )));
                }
                Some(
                    projection
                        .to_device(&self.device)?
                        .to_dtype(self.policy.reduction())?,
                )
            }
            None => None,
        };

        if !state.is_empty() {
            let mut extra: Vec<_> = state.into_keys().collect();
            extra.sort();
            return Err(AttentionError::config(format!(
                "checkpoint contains unused parameters: {}",
                extra.join(", ")
            )));
        }

        let [q_proj, k_proj, v_proj, out_proj] = staged;
        self.q_proj = q_proj;
        self.k_proj = k_proj;
        self.v_proj = v_proj;
        self.out_proj = out_proj;
        if let Some(projection) = eval_proj {
            self.eval_proj = OnceLock::from(projection);
        }
        Ok(())
    }

    /// Writes the parameters and the evaluation projection to a safetensors file.
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<(), AttentionError> {
        self.eval_projection()?;
        checkpoint::save_state_dict(&self.state_dict(), path.as_ref())
    }

    pub fn load_safetensors(&mut self, path: impl AsRef<Path>) -> Result<(), AttentionError> {
        let state = checkpoint::load_state_dict(path.as_ref(), &self.device)?;
        self.load_state_dict(state)
    }

    fn projection_builder(&self) -> ProjectionBuilder {
        ProjectionBuilder::new(
            self.config.n_heads,
            self.config.approx_attn_dim,
            self.config.head_dim(),
        )
    }

    fn training_projection(&self) -> Result<Tensor, AttentionError> {
        let seed = self.next_seed();
        log::debug!("drawing training projection with seed {seed}");
        self.projection_builder()
            .build(seed, &self.device, self.policy.reduction())
    }

    fn next_seed(&self) -> u64 {
        let draw = self.draws.fetch_add(1, Ordering::Relaxed) + 1;
        self.config.seed.wrapping_add(draw.wrapping_mul(SEED_MIX))
    }

    /// `(B, N, H·D)` -> `(B, H, N, D)` in the reduction dtype.
    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor, AttentionError> {
        let (batch, seq, _) = tensor.dims3()?;
        let heads = self.config.n_heads;
        let split = tensor
            .reshape((batch, seq, heads, self.config.head_dim()))?
            .transpose(1, 2)?
            .contiguous()?;
        Ok(self.policy.cast_for_reduction(&split)?)
    }

    fn projections(&self) -> [&Linear; 4] {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.out_proj]
    }
}
