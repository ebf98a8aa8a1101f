//! Per-chunk state accumulation.
//!
//! `S[b, n, h] = sum_t phi(k[b, n, t, h]) (x) v[b, n, t, h]`, an outer-product
//! sum in expanded feature space. Keys arrive already discounted by the
//! intra-chunk gate so the states combine directly with chunk-level decays.

use candle_core::{Result, Tensor};

use crate::kernels::batched_matmul;
use crate::kernels::expansion::SymmetricPowerMap;

/// Chunk state in a single contraction.
///
/// `k` is `[b, n, c, h, d]`, `v` is `[b, n, c, h, e]`; returns `[b, n, h, D, e]`.
pub fn chunk_state(k: &Tensor, v: &Tensor, map: &SymmetricPowerMap) -> Result<Tensor> {
    let (_, _, chunk_len, _, _) = k.dims5()?;
    contract(k, v, map, 0, chunk_len)
}

/// Chunk state accumulated over time sub-blocks of `time_block` positions.
///
/// Bounds the expanded key buffer to `[.., time_block, D]` at the cost of more,
/// smaller contractions.
pub fn chunk_state_blocked(
    k: &Tensor,
    v: &Tensor,
    map: &SymmetricPowerMap,
    time_block: usize,
) -> Result<Tensor> {
    if time_block == 0 {
        candle_core::bail!("time_block must be greater than 0");
    }
    let (_, _, chunk_len, _, _) = k.dims5()?;
    let mut state: Option<Tensor> = None;
    for start in (0..chunk_len).step_by(time_block) {
        let len = time_block.min(chunk_len - start);
        let partial = contract(k, v, map, start, len)?;
        state = Some(match state {
            Some(acc) => (acc + partial)?,
            None => partial,
        });
    }
    match state {
        Some(state) => Ok(state),
        None => candle_core::bail!("chunk_state requires a non-empty chunk"),
    }
}

fn contract(
    k: &Tensor,
    v: &Tensor,
    map: &SymmetricPowerMap,
    start: usize,
    len: usize,
) -> Result<Tensor> {
    // [b, n, t, h, D] -> [b, n, h, D, t]
    let phi = map
        .apply(&k.narrow(2, start, len)?)?
        .permute((0, 1, 3, 4, 2))?
        .contiguous()?;
    // [b, n, t, h, e] -> [b, n, h, t, e]
    let values = v
        .narrow(2, start, len)?
        .permute((0, 1, 3, 2, 4))?
        .contiguous()?;
    batched_matmul(&phi, &values)
}
