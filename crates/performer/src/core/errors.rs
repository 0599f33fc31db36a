//! Error types emitted by the performer attention stack.

use std::path::PathBuf;

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The module configuration violates a structural invariant.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
    /// A configuration file could not be read or parsed.
    #[error("configuration file {}: {message}", .path.display())]
    ConfigFile { path: PathBuf, message: String },
    /// QR decomposition of an orthogonal block failed.
    #[error("orthogonal block of size {size} could not be decomposed: {reason}")]
    Decomposition { size: usize, reason: String },
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    ShapeMismatch { context: String },
    /// A legacy checkpoint entry could not be migrated.
    #[error("legacy checkpoint entry {key}: {reason}")]
    LegacyCheckpoint { key: String, reason: String },
    /// Projection layer construction failed.
    #[error(transparent)]
    Layer(#[from] layers::LayerError),
    /// A backend-specific failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
        }
    }

    pub(crate) fn legacy(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LegacyCheckpoint {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
