//! All-pairs gated power attention.
//!
//! The gate is accumulated along positions once and the whole sequence is
//! handed to a single materialised attention block. Values carry a trailing
//! ones column so the block returns numerator and normaliser together.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};

use crate::checks::{validate_inputs, AttentionShape};
use crate::core::{Attention, AttentionError, Config};
use crate::kernels::attention_block::{attention_exact, BlockOptions};
use crate::kernels::{append_normalizer_column, cumsum_along, divide_by_normalizer, repeat_heads};

/// Reference implementation; ignores `chunk_size`.
#[derive(Debug, Default)]
pub struct QuadraticAttention {
    first_call: OnceLock<()>,
}

impl QuadraticAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for QuadraticAttention {
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
                "power_attention::quadratic init deg={} eps={} gated={} normalize_output={}",
                config.deg,
                config.eps,
                log_g.is_some(),
                config.normalize_output
            );
        }
        config.validate()?;
        let shape = validate_inputs(q, k, v, log_g)?;
        quadratic_forward(q, k, v, log_g, &shape, config)
    }
}

/// Quadratic path on validated inputs. Computes in `f32` and casts back to
/// the input dtype.
pub(crate) fn quadratic_forward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    log_g: Option<&Tensor>,
    shape: &AttentionShape,
    config: &Config,
) -> Result<Tensor, AttentionError> {
    let ratio = shape.head_ratio();
    let q = q.to_dtype(DType::F32)?;
    let k = repeat_heads(&k.to_dtype(DType::F32)?, ratio, 2)?;
    let v = repeat_heads(&v.to_dtype(DType::F32)?, ratio, 2)?;
    let gate = log_g
        .map(|g| repeat_heads(&cumsum_along(g, 1)?, ratio, 2))
        .transpose()?;
    log::trace!(
        "power_attention::quadratic batch={} seq_len={} heads={} ratio={ratio}",
        shape.batch,
        shape.seq_len,
        shape.q_heads
    );

    let options = BlockOptions::causal(config.deg, config.eps);
    let output = if config.normalize_output {
        let options = BlockOptions {
            normalize: true,
            ..options
        };
        attention_exact(&q, &k, &v, gate.as_ref(), gate.as_ref(), &options)?.output
    } else {
        let v = append_normalizer_column(&v)?;
        let block = attention_exact(&q, &k, &v, gate.as_ref(), gate.as_ref(), &options)?;
        divide_by_normalizer(&block.output, config.eps)?
    };
    Ok(output.to_dtype(shape.dtype)?)
}
