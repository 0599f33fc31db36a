//! FAVOR+ attention: a linear-time approximation of softmax attention.
//!
//! The crate builds random projections per head (optionally from orthogonal
//! blocks), maps queries and keys to nonnegative random features whose inner
//! products estimate `exp(q·k / √D)`, and aggregates values from those
//! features either with an explicit score matrix (exact position masks) or
//! associatively in time linear in sequence length.
//!
//! Tensors use the layout `[batch, n_heads, seq_len, head_dim]` inside the
//! core and `[batch, seq_len, d_model]` at the [`PerformerAttention`]
//! boundary. Feature maps and aggregation run in the reduction dtype of the
//! layer's [`layers::PrecisionPolicy`] (`f32` unless parameters are `f64`);
//! outputs are cast back to the parameter dtype.
//!
//! Numerical degeneracy is never an error: every normalizer is clamped to at
//! least [`aggregate::NORMALIZER_EPS`] before division.

pub mod aggregate;
pub mod attention;
pub mod checkpoint;
pub mod core;
pub mod features;
pub mod incremental;
pub mod masks;
pub mod projection;

pub use attention::PerformerAttention;
pub use checkpoint::{AttentionRecord, LegacyAttentionRecord, LinearRecord};
pub use core::{AttentionError, FeatureAttention, PerformerConfig};
pub use features::{key_features, query_features, Stabilizer};
pub use incremental::{append_prev_key_padding_mask, CacheState};
pub use projection::ProjectionBuilder;
