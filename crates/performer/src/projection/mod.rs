//! Random projection construction: orthogonal blocks and per-head stacks.

pub mod builder;
pub mod orthogonal;

pub use builder::{ProjectionBuilder, HEAD_SEED_STRIDE};
pub use orthogonal::{orthogonal_block, sample_orthogonal_block};
