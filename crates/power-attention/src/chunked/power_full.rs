//! Chunked gated power attention.
//!
//! The sequence is cut into `n` chunks of `c` positions. Within a chunk the
//! attention block runs exactly; across chunks a state in expanded feature
//! space carries everything earlier positions contribute:
//!
//! ```text
//! g_intra   = cumsum(log_g) within each chunk
//! S_local   = sum_t phi(k_t * exp((g_intra[c-1] - g_intra[t]) / deg)) (x) [v_t, 1]
//! S_cum     = discumsum(S_local, g_intra[c-1])[..n]
//! Y_local   = block(q, k, [v, 1], gate = g_intra)
//! Y         = query_state(q * exp(g_intra / deg), S_cum, Y_local, rowmax)
//! output    = Y[.., :e] / Y[.., e]
//! ```
//!
//! The ones column makes the final ratio independent of the per-row
//! normaliser, so the output does not depend on the chunk size.

use candle_core::{DType, Tensor, D};

use crate::checks::{validate_inputs, AttentionShape};
use crate::chunked::linear::linear_forward;
use crate::core::{AttentionError, Config};
use crate::kernels::{
    append_normalizer_column, cumsum_along, divide_by_normalizer, repeat_heads, select_kernels,
    BlockOptions, KernelKey, SymmetricPowerMap,
};
use crate::reference::quadratic_forward;

/// Fewer chunks than this run on the quadratic path.
pub const MIN_CHUNKS: usize = 4;

/// How a validated sequence will be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkPlan {
    Quadratic,
    Chunked { chunk_len: usize, chunks: usize },
}

pub(crate) fn plan_chunks(
    seq_len: usize,
    chunk_size: Option<usize>,
) -> Result<ChunkPlan, AttentionError> {
    let chunk_len = match chunk_size {
        Some(size) if size < seq_len => size,
        _ => return Ok(ChunkPlan::Quadratic),
    };
    if seq_len % chunk_len != 0 {
        return Err(AttentionError::ChunkLength {
            seq_len,
            chunk_size: chunk_len,
        });
    }
    let chunks = seq_len / chunk_len;
    if chunks < MIN_CHUNKS {
        log::debug!(
            "power_attention::chunked {chunks} chunks of {chunk_len} is below {MIN_CHUNKS}; using the quadratic path"
        );
        return Ok(ChunkPlan::Quadratic);
    }
    Ok(ChunkPlan::Chunked { chunk_len, chunks })
}

/// Gated causal power attention with optional chunking.
///
/// * `q` is `[b, t, hq, d]`, `k` is `[b, t, hk, d]`, `v` is `[b, t, hk, e]`
///   with `hq` a multiple of `hk`; all three share one of `f16`, `bf16`, `f32`.
/// * `log_g` is an `f32` `[b, t, hk]` tensor of per-position log decays.
/// * `initial_state` is reserved and must be `None`.
///
/// Returns `[b, t, hq, e]` in the input dtype. `deg == 1` takes the linear
/// path; short sequences or fewer than [`MIN_CHUNKS`] chunks take the
/// quadratic path.
pub fn power_full(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    log_g: Option<&Tensor>,
    initial_state: Option<&Tensor>,
    config: &Config,
) -> Result<Tensor, AttentionError> {
    if initial_state.is_some() {
        return Err(AttentionError::Unimplemented {
            feature: "initial_state",
        });
    }
    config.validate()?;
    let shape = validate_inputs(q, k, v, log_g)?;

    if config.deg == 1 {
        return linear_forward(q, k, v, log_g, &shape, config);
    }

    match plan_chunks(shape.seq_len, config.chunk_size)? {
        ChunkPlan::Quadratic => quadratic_forward(q, k, v, log_g, &shape, config),
        ChunkPlan::Chunked { .. } if config.normalize_output => {
            Err(AttentionError::Unimplemented {
                feature: "output normalisation across multiple chunks",
            })
        }
        ChunkPlan::Chunked { chunk_len, chunks } => {
            chunked_forward(q, k, v, log_g, &shape, config, chunk_len, chunks)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn chunked_forward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    log_g: Option<&Tensor>,
    shape: &AttentionShape,
    config: &Config,
    chunk_len: usize,
    chunks: usize,
) -> Result<Tensor, AttentionError> {
    let AttentionShape {
        batch: b,
        seq_len: t,
        q_heads: hq,
        kv_heads: hk,
        head_dim: d,
        value_dim: e,
        ..
    } = *shape;
    let (n, c) = (chunks, chunk_len);
    let ratio = shape.head_ratio();
    let deg = config.deg;
    let device = q.device();

    let map = SymmetricPowerMap::new(d, deg)?;
    let key = KernelKey {
        head_dim: d,
        value_dim: e,
        deg,
        dtype: shape.dtype,
        chunk_len,
    };
    let kernels = select_kernels(&key, config.backend);
    log::trace!(
        "power_attention::chunked b={b} t={t} hq={hq} hk={hk} d={d} e={e} chunks={n}x{c} expanded={}",
        map.expanded_dim()
    );

    // [b, n, c, h, x]
    let q = q.to_dtype(DType::F32)?.reshape((b, n, c, hq, d))?;
    let k = k.to_dtype(DType::F32)?.reshape((b, n, c, hk, d))?;
    let v = append_normalizer_column(&v.to_dtype(DType::F32)?)?.reshape((b, n, c, hk, e + 1))?;
    let gate = match log_g {
        Some(g) => g.reshape((b, n, c, hk))?,
        None => Tensor::zeros((b, n, c, hk), DType::F32, device)?,
    };
    let g_intra = cumsum_along(&gate, 2)?;
    let g_last = g_intra.narrow(2, c - 1, 1)?;

    let key_discount = (g_last.broadcast_sub(&g_intra)? / deg as f64)?
        .exp()?
        .unsqueeze(D::Minus1)?;
    let local_states = kernels.chunk_state(&k.broadcast_mul(&key_discount)?, &v, &map)?;

    let chunk_decay = g_last.squeeze(2)?.contiguous()?;
    let states = kernels
        .discumsum(&local_states, &chunk_decay, config.deterministic)?
        .narrow(1, 0, n)?;
    log::debug!(
        "power_attention::chunked kernels={} scan={}",
        kernels.name(),
        if config.deterministic { "sequential" } else { "tree" }
    );

    let g_heads = repeat_heads(&g_intra, ratio, 3)?;
    let flat_gate = g_heads.reshape((b * n, c, hq))?;
    let block = kernels.attention(
        &q.reshape((b * n, c, hq, d))?,
        &repeat_heads(&k, ratio, 3)?.reshape((b * n, c, hq, d))?,
        &repeat_heads(&v, ratio, 3)?.reshape((b * n, c, hq, e + 1))?,
        Some(&flat_gate),
        Some(&flat_gate),
        &BlockOptions::causal(deg, config.eps),
    )?;
    let y_local = block.output.reshape((b, n, c, hq, e + 1))?;
    let rowmax = block.rowmax.reshape((b, n, c, hq))?;

    let query_scale = (g_heads / deg as f64)?.exp()?.unsqueeze(D::Minus1)?;
    let y = kernels.query_state(
        &q.broadcast_mul(&query_scale)?,
        &repeat_heads(&states, ratio, 2)?,
        &y_local,
        &rowmax,
        &map,
        config.stabilizer_or_default(),
    )?;

    let y = y.reshape((b, t, hq, e + 1))?;
    Ok(divide_by_normalizer(&y, config.eps)?.to_dtype(shape.dtype)?)
}
