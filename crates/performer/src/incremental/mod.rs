//! Buffered state for incremental (token-by-token) decoding.
//!
//! The attention module itself keeps nothing between calls; callers that
//! layer a decoding cache on top hold an `Option<CacheState>` and hand it to
//! [`PerformerAttention::reorder_incremental_state`](crate::PerformerAttention::reorder_incremental_state)
//! whenever beam search permutes the batch.

mod state;

pub use state::{append_prev_key_padding_mask, CacheState};

#[cfg(test)]
mod tests;
