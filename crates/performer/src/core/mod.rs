//! Core traits and types shared across the performer stack.
//!
//! Head-split tensors use the layout `[batch, n_heads, seq_len, head_dim]`;
//! random features replace the trailing `head_dim` with the feature count
//! `approx_attn_dim`. All kernel math runs in `f32` or wider.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::PerformerConfig;
pub use errors::AttentionError;

/// Aggregation of values weighted by a random-feature kernel.
///
/// * `q_prime` is `[batch, heads, q_len, features]`, `k_prime` is
///   `[batch, heads, k_len, features]`, both nonnegative.
/// * `v` is `[batch, heads, k_len, head_dim]`; the result is
///   `[batch, heads, q_len, head_dim]`.
/// * `mask`, when given, is an additive mask broadcastable to
///   `[batch, heads, q_len, k_len]` (see [`crate::masks`]).
pub trait FeatureAttention: Send + Sync {
    fn attend(
        &self,
        q_prime: &Tensor,
        k_prime: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError>;
}
