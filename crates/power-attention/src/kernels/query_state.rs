//! Long-range contribution and merge with intra-chunk attention.
//!
//! The intra-chunk output is scaled by `exp(-rowmax)` while the state term is
//! unscaled. Both are brought to a shared normaliser
//! `log_norm = max(rowmax, ln(stabilizer))`:
//!
//! ```text
//! y = exp(rowmax - log_norm) * y_local + exp(-log_norm) * (phi(q) . S)
//! ```
//!
//! which equals `(exp(rowmax) y_local + phi(q) . S) / max(exp(rowmax), stabilizer)`.
//! When `S` is zero and `rowmax >= ln(stabilizer)` the result is `y_local`
//! bit for bit.

use candle_core::{Result, Tensor, D};

use crate::kernels::batched_matmul;
use crate::kernels::expansion::SymmetricPowerMap;

/// Per-row factors `(attn_factor, far_factor)`, each `[b, n, c, h, 1]`.
fn merge_factors(rowmax: &Tensor, stabilizer: f64) -> Result<(Tensor, Tensor)> {
    let floor = Tensor::new(stabilizer.ln() as f32, rowmax.device())?;
    let rowmax = rowmax.detach();
    let log_norm = rowmax.broadcast_maximum(&floor)?;
    let attn_factor = (rowmax - &log_norm)?.exp()?.unsqueeze(D::Minus1)?;
    let far_factor = log_norm.neg()?.exp()?.unsqueeze(D::Minus1)?;
    Ok((attn_factor, far_factor))
}

/// `phi(q) . S` for `q` `[b, n, c, h, d]` and `S` `[b, n, h, D, e]`, as `[b, n, c, h, e]`.
fn state_term(q: &Tensor, states: &Tensor, map: &SymmetricPowerMap) -> Result<Tensor> {
    let phi = map.apply(q)?.permute((0, 1, 3, 2, 4))?.contiguous()?;
    batched_matmul(&phi, states)?
        .permute((0, 1, 3, 2, 4))?
        .contiguous()
}

fn check_shapes(q: &Tensor, states: &Tensor, y_local: &Tensor, rowmax: &Tensor) -> Result<()> {
    let (b, n, c, h, _) = q.dims5()?;
    let (sb, sn, sh, _, e) = states.dims5()?;
    if (sb, sn, sh) != (b, n, h) {
        candle_core::bail!("query_state: state leading dims do not match queries");
    }
    if y_local.dims() != [b, n, c, h, e].as_slice() {
        candle_core::bail!(
            "query_state: attention output {:?} does not match [{b}, {n}, {c}, {h}, {e}]",
            y_local.dims()
        );
    }
    if rowmax.dims() != [b, n, c, h].as_slice() {
        candle_core::bail!("query_state: rowmax {:?} does not match queries", rowmax.dims());
    }
    Ok(())
}

/// Merge the propagated state into the intra-chunk attention output.
///
/// `q` must already carry the `exp(g_intra / deg)` gate scaling.
pub fn query_state(
    q: &Tensor,
    states: &Tensor,
    y_local: &Tensor,
    rowmax: &Tensor,
    map: &SymmetricPowerMap,
    stabilizer: f64,
) -> Result<Tensor> {
    check_shapes(q, states, y_local, rowmax)?;
    let (attn_factor, far_factor) = merge_factors(rowmax, stabilizer)?;
    let far = state_term(q, states, map)?;
    y_local.broadcast_mul(&attn_factor)? + far.broadcast_mul(&far_factor)?
}

/// Same merge with queries expanded `query_block` chunk positions at a time.
pub fn query_state_blocked(
    q: &Tensor,
    states: &Tensor,
    y_local: &Tensor,
    rowmax: &Tensor,
    map: &SymmetricPowerMap,
    stabilizer: f64,
    query_block: usize,
) -> Result<Tensor> {
    if query_block == 0 {
        candle_core::bail!("query_block must be greater than 0");
    }
    check_shapes(q, states, y_local, rowmax)?;
    let (_, _, chunk_len, _, _) = q.dims5()?;
    let (attn_factor, far_factor) = merge_factors(rowmax, stabilizer)?;

    let mut pieces = Vec::with_capacity(chunk_len.div_ceil(query_block));
    for start in (0..chunk_len).step_by(query_block) {
        let len = query_block.min(chunk_len - start);
        let far = state_term(&q.narrow(2, start, len)?, states, map)?;
        let merged = (y_local
            .narrow(2, start, len)?
            .broadcast_mul(&attn_factor.narrow(2, start, len)?)?
            + far.broadcast_mul(&far_factor.narrow(2, start, len)?)?)?;
        pieces.push(merged);
    }
    Tensor::cat(&pieces, 2)
}
