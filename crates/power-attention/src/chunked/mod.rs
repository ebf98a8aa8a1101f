//! Linear-time chunked power attention.

pub mod linear;
pub mod power_full;

use std::sync::OnceLock;

use candle_core::Tensor;

use crate::core::{Attention, AttentionError, Config};

pub use linear::linear_full;
pub use power_full::{power_full, MIN_CHUNKS};

/// [`Attention`] front end for [`power_full`] without an initial state.
#[derive(Debug, Default)]
pub struct ChunkedAttention {
    first_call: OnceLock<()>,
}

impl ChunkedAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ChunkedAttention {
    fn compute_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        log_g: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "power_attention::chunked init deg={} chunk_size={:?} stabilizer={} deterministic={} backend={:?} normalize_output={}",
                config.deg,
                config.chunk_size,
                config.stabilizer_or_default(),
                config.deterministic,
                config.backend,
                config.normalize_output
            );
        }
        power_full(q, k, v, log_g, None, config)
    }
}
