//! Nonnegative random features for the softmax kernel (FAVOR+).
//!
//! For `w ~ N(0, I)` and `x̃ = x · D^(-1/4)`:
//!
//! `exp(q·k / √D) = E_w[ exp(w·q̃ - |q̃|²/2) · exp(w·k̃ - |k̃|²/2) ]`
//!
//! Each row `w_j` of a projection yields one feature
//! `M^(-1/2) · exp(w_j·x̃ - |x̃|²/2 - c) + eps`. The shift `c` keeps the
//! exponent bounded; it is the max over features for queries (one shift per
//! position) and the max over features and positions for keys (one shift per
//! batch and head). A per-query shift cancels in row normalization, and a
//! shared key shift cancels between numerator and normalizer.

use candle_core::{Tensor, D};

use crate::core::AttentionError;

/// Additive floor that keeps features strictly positive.
pub const FEATURE_EPS: f64 = 1e-4;

/// Scope of the log-domain shift applied before exponentiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stabilizer {
    /// No shift. Only safe for small inputs; used to check kernel estimates.
    None,
    /// Max over the feature axis, per position.
    PerPosition,
    /// Max over the feature and sequence axes, per batch and head.
    Global,
}

/// Query features: `(B, H, N, D)` with `(H, M, D)` projection -> `(B, H, N, M)`.
pub fn query_features(data: &Tensor, projection: &Tensor) -> Result<Tensor, AttentionError> {
    favor_features(data, projection, Stabilizer::PerPosition, FEATURE_EPS)
}

/// Key features: `(B, H, N, D)` with `(H, M, D)` projection -> `(B, H, N, M)`.
pub fn key_features(data: &Tensor, projection: &Tensor) -> Result<Tensor, AttentionError> {
    favor_features(data, projection, Stabilizer::Global, FEATURE_EPS)
}

/// Shared feature map behind [`query_features`] and [`key_features`].
pub fn favor_features(
    data: &Tensor,
    projection: &Tensor,
    stabilizer: Stabilizer,
    eps: f64,
) -> Result<Tensor, AttentionError> {
    let (_, heads, _, head_dim) = data
        .dims4()
        .map_err(|_| AttentionError::shape("features input must be [batch, heads, seq, head_dim]"))?;
    let (proj_heads, features, proj_dim) = projection
        .dims3()
        .map_err(|_| AttentionError::shape("projection must be [heads, features, head_dim]"))?;
    if proj_heads != heads || proj_dim != head_dim {
        return Err(AttentionError::shape(format!(
            "projection [{proj_heads}, {features}, {proj_dim}] does not match input heads {heads} / head_dim {head_dim}"
        )));
    }

    let projection = projection.to_dtype(data.dtype())?;
    let data_normalizer = (head_dim as f64).powf(-0.25);
    let ratio = (features as f64).powf(-0.5);

    // (1, H, D, M)
    let proj_t = projection.transpose(1, 2)?.contiguous()?.unsqueeze(0)?;
    let data_dash = data.affine(data_normalizer, 0.0)?.broadcast_matmul(&proj_t)?;

    let diag_data = data
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .affine(0.5 * data_normalizer * data_normalizer, 0.0)?;
    let log_features = data_dash.broadcast_sub(&diag_data)?;

    let shifted = match stabilizer {
        Stabilizer::None => log_features,
        Stabilizer::PerPosition => {
            let shift = data_dash.max_keepdim(D::Minus1)?;
            log_features.broadcast_sub(&shift)?
        }
        Stabilizer::Global => {
            let shift = data_dash.max_keepdim(D::Minus1)?.max_keepdim(D::Minus2)?;
            log_features.broadcast_sub(&shift)?
        }
    };

    Ok(shifted.exp()?.affine(ratio, eps)?)
}
