//! Error types emitted by power attention implementations.

use thiserror::Error;

/// Power-attention error category.
///
/// Contract violations (bad shapes, dtypes, ratios, chunk lengths, config
/// values) are reported before any numeric work starts. Features that are
/// declared but not supported surface as [`AttentionError::Unimplemented`] so
/// callers can tell "not yet supported" apart from "invalid input".
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// Query heads are not an integer multiple of key/value heads.
    #[error("query heads ({query_heads}) must be a multiple of key/value heads ({kv_heads})")]
    HeadRatio { query_heads: usize, kv_heads: usize },
    /// Sequence length is not divisible by the requested chunk size.
    #[error("sequence length {seq_len} is not divisible by chunk size {chunk_size}")]
    ChunkLength { seq_len: usize, chunk_size: usize },
    /// One or more configuration values are out of range.
    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
    /// The requested feature is declared but not implemented.
    #[error("{feature} is not implemented")]
    Unimplemented { feature: &'static str },
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    /// A backend-specific failure propagated to the caller.
    #[error("{message}")]
    Backend { message: String },
}

impl AttentionError {
    pub fn invalid_shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    /// True for errors caused by inputs or configuration the caller supplied.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            AttentionError::InvalidShape { .. }
                | AttentionError::UnsupportedDType { .. }
                | AttentionError::HeadRatio { .. }
                | AttentionError::ChunkLength { .. }
                | AttentionError::InvalidConfig(_)
        )
    }

    pub fn is_unimplemented(&self) -> bool {
        matches!(self, AttentionError::Unimplemented { .. })
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend {
            message: err.to_string(),
        }
    }
}
