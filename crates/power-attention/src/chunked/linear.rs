//! Degree-one gated attention evaluated in normal space.
//!
//! With `deg == 1` the feature map is the identity, so the chunk state is a
//! plain `[d, e + 1]` matrix and weights `(q . k) * exp(G_i - G_j)` can be
//! formed directly without the log-domain row max.

use candle_core::{DType, Tensor, D};

use crate::checks::{validate_inputs, AttentionShape};
use crate::chunked::power_full::{plan_chunks, ChunkPlan};
use crate::core::{AttentionError, Config};
use crate::kernels::discumsum::{discumsum_sequential, discumsum_tree};
use crate::kernels::normalize::normalize_output;
use crate::kernels::{
    append_normalizer_column, batched_matmul, cumsum_along, divide_by_normalizer, repeat_heads,
};
use crate::masks::build_causal_mask;

/// Gated causal linear attention; same contract as
/// [`power_full`](crate::chunked::power_full) with the degree fixed at one.
pub fn linear_full(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    log_g: Option<&Tensor>,
    config: &Config,
) -> Result<Tensor, AttentionError> {
    config.validate()?;
    let shape = validate_inputs(q, k, v, log_g)?;
    linear_forward(q, k, v, log_g, &shape, config)
}

pub(crate) fn linear_forward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    log_g: Option<&Tensor>,
    shape: &AttentionShape,
    config: &Config,
) -> Result<Tensor, AttentionError> {
    let (chunk_len, chunks) = match plan_chunks(shape.seq_len, config.chunk_size)? {
        ChunkPlan::Quadratic => (shape.seq_len, 1),
        ChunkPlan::Chunked { .. } if config.normalize_output => {
            return Err(AttentionError::Unimplemented {
                feature: "output normalisation across multiple chunks",
            });
        }
        ChunkPlan::Chunked { chunk_len, chunks } => (chunk_len, chunks),
    };
    let AttentionShape {
        batch: b,
        seq_len: t,
        q_heads: hq,
        kv_heads: hk,
        value_dim: e,
        ..
    } = *shape;
    let (n, c) = (chunks, chunk_len);
    let ratio = shape.head_ratio();
    let width = if config.normalize_output { e } else { e + 1 };
    log::trace!("power_attention::linear b={b} t={t} hq={hq} hk={hk} chunks={n}x{c}");

    let v = v.to_dtype(DType::F32)?;
    let v = if config.normalize_output {
        v
    } else {
        append_normalizer_column(&v)?
    };
    // [b, n, h, c, x]
    let q = to_chunks(&q.to_dtype(DType::F32)?, n, c)?;
    let k = to_chunks(&k.to_dtype(DType::F32)?, n, c)?;
    let v = to_chunks(&v, n, c)?;
    let gate = match log_g {
        Some(g) => g.reshape((b, n, c, hk))?.permute((0, 1, 3, 2))?.contiguous()?,
        None => Tensor::zeros((b, n, hk, c), DType::F32, q.device())?,
    };
    // [b, n, h, c]
    let g_intra = cumsum_along(&gate, 3)?;
    let g_heads = repeat_heads(&g_intra, ratio, 2)?;

    let mut y = local_linear(
        &q,
        &repeat_heads(&k, ratio, 2)?,
        &repeat_heads(&v, ratio, 2)?,
        &g_heads,
    )?;

    if n > 1 {
        let g_last = g_intra.narrow(3, c - 1, 1)?;
        let key_discount = g_last.broadcast_sub(&g_intra)?.exp()?.unsqueeze(D::Minus1)?;
        // [b, n, hk, d, e + 1]
        let discounted = k.broadcast_mul(&key_discount)?.transpose(3, 4)?;
        let local_states = batched_matmul(&discounted, &v)?;
        let chunk_decay = g_last.squeeze(3)?.contiguous()?;
        let states = if config.deterministic {
            discumsum_sequential(&local_states, &chunk_decay)?
        } else {
            discumsum_tree(&local_states, &chunk_decay)?
        }
        .narrow(1, 0, n)?;
        let states = repeat_heads(&states, ratio, 2)?.contiguous()?;

        let query_scale = g_heads.exp()?.unsqueeze(D::Minus1)?;
        let far = batched_matmul(&q.broadcast_mul(&query_scale)?, &states)?;
        y = (y + far)?;
    }

    // [b, n, hq, c, x] -> [b, t, hq, x]
    let y = y
        .permute((0, 1, 3, 2, 4))?
        .contiguous()?
        .reshape((b, t, hq, width))?;
    let output = if config.normalize_output {
        normalize_output(&y)?
    } else {
        divide_by_normalizer(&y, config.eps)?
    };
    Ok(output.to_dtype(shape.dtype)?)
}

/// `[b, t, h, x]` to head-major chunks `[b, n, h, c, x]`.
fn to_chunks(x: &Tensor, chunks: usize, chunk_len: usize) -> candle_core::Result<Tensor> {
    let (b, _, h, width) = x.dims4()?;
    x.reshape((b, chunks, chunk_len, h, width))?
        .permute((0, 1, 3, 2, 4))?
        .contiguous()
}

/// Causal gated attention inside each chunk, without a normaliser.
///
/// The mask is added before exponentiation so `exp(G_i - G_j)` never
/// overflows for future keys.
fn local_linear(q: &Tensor, k: &Tensor, v: &Tensor, gate: &Tensor) -> candle_core::Result<Tensor> {
    let chunk_len = q.dim(3)?;
    let scores = batched_matmul(q, &k.transpose(3, 4)?)?;
    let mask = build_causal_mask(q.device(), chunk_len, chunk_len)?;
    let decay = gate
        .unsqueeze(D::Minus1)?
        .broadcast_sub(&gate.unsqueeze(3)?)?
        .broadcast_add(&mask)?
        .exp()?;
    batched_matmul(&(scores * decay)?, v)
}
