//! Linear and affine projection helpers.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` and return tensors
//! with `(batch, seq, out_dim)`; `(rows, in_dim)` inputs are also accepted.
//! Weights and activations are cast to [`PrecisionPolicy::compute`] for the
//! matmul and the result is cast back with
//! [`PrecisionPolicy::cast_to_storage`](crate::dtypes::PrecisionPolicy::cast_to_storage).
//!
//! [`QuantNoise`] implements the training-only structured weight dropout
//! (q-noise) that attention projections accept as a pass-through option.

use candle_core::{DType, Device, Error, Result, Tensor};
use rand::Rng;

use crate::{checks, dtypes::PrecisionPolicy, LayerError};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a projection layer with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Kaiming/He uniform initialisation with the given leaky slope.
    KaimingUniform { negative_slope: f64 },
}

impl LinearInit {
    /// Kaiming uniform with slope `sqrt(5)`, i.e. a `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`
    /// draw, the usual default for dense projections.
    pub fn fan_in_uniform() -> Self {
        LinearInit::KaimingUniform {
            negative_slope: 5f64.sqrt(),
        }
    }

    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = 3f64.sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
        };
        if dtype == DType::F32 {
            Ok(weight)
        } else {
            weight.to_dtype(dtype)
        }
    }
}

/// Structured weight dropout applied to projection weights while training.
///
/// Each output row is split into blocks of `block_size` consecutive input
/// columns; every block is dropped with probability `p` and survivors are
/// rescaled by `1 / (1 - p)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantNoise {
    pub p: f32,
    pub block_size: usize,
}

impl QuantNoise {
    /// Validates the noise settings against a layer's input dimension.
    pub fn new(p: f32, block_size: usize, input_dim: usize) -> std::result::Result<Self, LayerError> {
        if !(0.0..1.0).contains(&p) {
            return Err(LayerError::QuantNoiseProbability(p));
        }
        if p > 0.0 && (block_size == 0 || input_dim % block_size != 0) {
            return Err(LayerError::QuantNoiseBlock {
                input_dim,
                block_size,
            });
        }
        Ok(Self { p, block_size })
    }

    /// Whether the noise changes anything.
    pub fn is_active(&self) -> bool {
        self.p > 0.0
    }

    /// Returns `weight` with dropped blocks zeroed and survivors rescaled.
    pub fn apply(&self, weight: &Tensor) -> Result<Tensor> {
        if !self.is_active() {
            return Ok(weight.clone());
        }
        let (out_dim, in_dim) = weight.dims2()?;
        let blocks = in_dim / self.block_size;
        let keep_scale = 1.0 / (1.0 - self.p);
        let mut rng = rand::thread_rng();
        let mut mask = Vec::with_capacity(out_dim * in_dim);
        for _ in 0..out_dim {
            for _ in 0..blocks {
                let value = if rng.gen_bool(f64::from(self.p)) {
                    0.0
                } else {
                    keep_scale
                };
                mask.extend(std::iter::repeat(value).take(self.block_size));
            }
        }
        let mask = Tensor::from_vec(mask, (out_dim, in_dim), weight.device())?
            .to_dtype(weight.dtype())?;
        weight.mul(&mask)
    }
}

/// Dense affine projection with optional bias and q-noise.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
    quant_noise: Option<QuantNoise>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
            quant_noise: None,
        })
    }

    /// Builds a linear layer with randomly initialised weights following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Attaches training-time q-noise to the layer.
    pub fn with_quant_noise(mut self, noise: QuantNoise) -> Self {
        self.quant_noise = noise.is_active().then_some(noise);
        self
    }

    /// Returns a handle to the weight tensor, shaped `(output_dim, input_dim)`.
    pub fn weight(&self) -> Tensor {
        self.weight.clone()
    }

    /// Returns a handle to the bias tensor if present.
    pub fn bias(&self) -> Option<Tensor> {
        self.bias.clone()
    }

    /// Replaces the weight, casting to the current parameter dtype.
    pub fn load_weight(&mut self, value: &Tensor) -> Result<()> {
        let cast = value.to_dtype(self.weight.dtype())?;
        Self::validate_weight(&self.config, &cast)?;
        self.weight = cast;
        Ok(())
    }

    /// Replaces the bias, casting to the current parameter dtype.
    pub fn load_bias(&mut self, value: &Tensor) -> Result<()> {
        match &self.bias {
            Some(existing) => {
                let cast = value.to_dtype(existing.dtype())?;
                Self::validate_bias(&self.config, Some(&cast))?;
                self.bias = Some(cast);
                Ok(())
            }
            None => Err(Error::Msg("layer has no bias to load into".into())),
        }
    }

    /// Applies the projection; q-noise is only drawn when `training` is set.
    pub fn forward_t(&self, hidden: &Tensor, policy: &PrecisionPolicy, training: bool) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight = match (&self.quant_noise, training) {
            (Some(noise), true) => noise.apply(&self.weight)?,
            _ => self.weight.clone(),
        };
        let weight_t = policy.cast_for_matmul(&weight)?.t()?;

        let mut output = match input.dims() {
            [batch, seq, _] => {
                let flat = input.reshape((*batch * *seq, self.config.input_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((*batch, *seq, self.config.output_dim))?
            }
            _ => input.matmul(&weight_t)?,
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }

        policy.cast_to_storage(&output)
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in(
            "linear.weight",
            weight,
            &[DType::F16, DType::BF16, DType::F32, DType::F64],
        )
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in(
                    "linear.bias",
                    tensor,
                    &[DType::F16, DType::BF16, DType::F32, DType::F64],
                )
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [batch, seq, _] => {
                checks::expect_batch_seq_hidden("linear.input", hidden, self.config.input_dim)?;
                if *batch == 0 || *seq == 0 {
                    Err(Error::Msg("batch/seq dimensions must be non-zero".into()))
                } else {
                    Ok(())
                }
            }
            [_, hidden_dim] if *hidden_dim == self.config.input_dim => Ok(()),
            [_, hidden_dim] => Err(Error::Msg(format!(
                "expected last dim {} but received {}",
                self.config.input_dim, hidden_dim
            ))),
            _ => Err(Error::Msg(
                "linear expects input shaped [B, T, H_in] or [T, H_in]".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_linear(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let (batch, seq, hidden) = input.dims3()?;
        let mut out = input
            .reshape((batch * seq, hidden))?
            .matmul(&weight.t()?)?
            .reshape((batch, seq, weight.dims()[0]))?;
        if let Some(bias) = bias {
            out = out.broadcast_add(bias)?;
        }
        Ok(out)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn forward_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 12);
        let weight = Tensor::randn(0f32, 0.05, (config.output_dim, config.input_dim), &device)?;
        let bias = Tensor::randn(0f32, 0.02, config.output_dim, &device)?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let linear = Linear::new(
                config.clone(),
                weight.to_dtype(dtype)?,
                Some(bias.to_dtype(dtype)?),
            )?;
            let input =
                Tensor::randn(0f32, 1.0, (2, 5, config.input_dim), &device)?.to_dtype(dtype)?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = linear.forward_t(&input, &policy, false)?;

            assert_eq!(output.dims(), &[2, 5, config.output_dim]);
            assert_eq!(output.dtype(), dtype);

            let reference = reference_linear(&input.to_dtype(DType::F32)?, &weight, Some(&bias))?;
            let tol = match dtype {
                DType::F16 => 1e-2,
                DType::BF16 => 2e-2,
                _ => 1e-4,
            };
            let max = max_abs_diff(&output, &reference)?;
            assert!(max <= tol, "max diff {} for {:?}", max, dtype);
        }

        Ok(())
    }

    #[test]
    fn fan_in_uniform_stays_within_bound() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(64, 32),
            &LinearInit::fan_in_uniform(),
            &device,
            DType::F32,
        )?;
        let bound = 1.0 / 64f32.sqrt();
        let max = linear.weight().abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max <= bound + 1e-6);
        Ok(())
    }

    #[test]
    fn load_weight_rejects_wrong_shape() -> Result<()> {
        let device = Device::Cpu;
        let mut linear = Linear::with_init(
            LinearConfig::new(4, 4),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let wrong = Tensor::zeros((4, 5), DType::F32, &device)?;
        assert!(linear.load_weight(&wrong).is_err());
        let right = Tensor::ones((4, 4), DType::F32, &device)?;
        linear.load_weight(&right)?;
        assert_eq!(max_abs_diff(&linear.weight(), &right)?, 0.0);
        Ok(())
    }

    #[test]
    fn quant_noise_validates_block_size() {
        assert!(QuantNoise::new(0.1, 3, 8).is_err());
        assert!(QuantNoise::new(1.0, 4, 8).is_err());
        assert!(QuantNoise::new(0.1, 4, 8).is_ok());
        // Inactive noise does not care about tiling.
        assert!(QuantNoise::new(0.0, 3, 8).is_ok());
    }

    #[test]
    fn quant_noise_drops_whole_blocks() -> Result<()> {
        let device = Device::Cpu;
        let noise = QuantNoise::new(0.5, 4, 16).map_err(|e| Error::Msg(e.to_string()))?;
        let weight = Tensor::ones((8, 16), DType::F32, &device)?;
        let noisy = noise.apply(&weight)?.to_vec2::<f32>()?;
        for row in noisy {
            for block in row.chunks(4) {
                let first = block[0];
                assert!(first == 0.0 || (first - 2.0).abs() < 1e-6);
                assert!(block.iter().all(|v| *v == first));
            }
        }
        Ok(())
    }

    #[test]
    fn quant_noise_only_applies_in_training() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig {
            input_dim: 8,
            output_dim: 8,
            bias: false,
        };
        let weight = Tensor::ones((8, 8), DType::F32, &device)?;
        let noise = QuantNoise::new(0.9, 8, 8).map_err(|e| Error::Msg(e.to_string()))?;
        let linear = Linear::new(config, weight, None)?.with_quant_noise(noise);
        let input = Tensor::ones((1, 2, 8), DType::F32, &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let eval = linear.forward_t(&input, &policy, false)?;
        let expected = Tensor::full(8f32, (1, 2, 8), &device)?;
        assert!(max_abs_diff(&eval, &expected)? < 1e-6);
        Ok(())
    }
}
