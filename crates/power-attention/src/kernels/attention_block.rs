//! Exact gated power attention over a bounded window.
//!
//! Logits fold the degree into the log domain,
//! `deg * ln(max(|q.k|, eps)) + gate_q[i] - gate_k[j]`, so the same
//! max-subtracted exponentiation used by softmax attention keeps every weight
//! in `(0, 1]`. Clamping rather than shifting by `eps` keeps each weight equal
//! to the exact `|q.k|^deg` the chunk states accumulate, except below `eps`.
//! The sign lost by the absolute value is reapplied as `sign(q.k)^deg`, which
//! is `+1` for even degrees and `sign(q.k)` for odd ones.
//!
//! Two variants share this contract: [`attention_exact`] materialises the whole
//! score matrix, [`attention_streaming`] walks key blocks with an online row
//! max. The returned `rowmax` is detached; it is a stabilisation constant.

use candle_core::{Tensor, D};

use crate::kernels::normalize::normalize_output;
use crate::kernels::sign_of;
use crate::masks::{block_fully_masked, build_causal_block_mask};

/// Initial running max; finite so `m_old - m_new` never becomes `inf - inf`.
const ROWMAX_FLOOR: f32 = -1e30;

/// Knobs for one attention block invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockOptions {
    pub deg: usize,
    pub eps: f64,
    pub causal: bool,
    /// Forward-only recentring and variance normalisation of `output`.
    pub normalize: bool,
}

impl BlockOptions {
    pub fn causal(deg: usize, eps: f64) -> Self {
        Self {
            deg,
            eps,
            causal: true,
            normalize: false,
        }
    }
}

/// Unnormalised block output and its per-row log normaliser.
#[derive(Debug, Clone)]
pub struct BlockOutput {
    /// `[batch, q_len, heads, value_dim]`.
    pub output: Tensor,
    /// `[batch, q_len, heads]`, detached.
    pub rowmax: Tensor,
}

/// Head-major views shared by both variants.
struct HeadMajor {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    gate_q: Option<Tensor>,
    gate_k: Option<Tensor>,
}

impl HeadMajor {
    fn new(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        gate_q: Option<&Tensor>,
        gate_k: Option<&Tensor>,
    ) -> candle_core::Result<Self> {
        // [b, t, h, x] -> [b, h, t, x]
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;
        // gates become [b, h, t, 1] for queries and [b, h, 1, t] for keys
        let gate_q = gate_q
            .map(|g| g.transpose(1, 2)?.contiguous()?.unsqueeze(D::Minus1))
            .transpose()?;
        let gate_k = gate_k
            .map(|g| g.transpose(1, 2)?.contiguous()?.unsqueeze(2))
            .transpose()?;
        Ok(Self {
            q,
            k,
            v,
            gate_q,
            gate_k,
        })
    }

    /// Signed, gated logits for keys `[start, start + len)`.
    fn logits(
        &self,
        start: usize,
        len: usize,
        options: &BlockOptions,
    ) -> candle_core::Result<(Tensor, Option<Tensor>)> {
        let (_, _, q_len, _) = self.q.dims4()?;
        let (_, _, k_len, _) = self.k.dims4()?;

        let k = self.k.narrow(2, start, len)?.contiguous()?;
        let dot = self.q.matmul(&k.t()?)?;
        let floor = Tensor::new(options.eps as f32, dot.device())?;
        let mut logits = (dot.abs()?.broadcast_maximum(&floor)?.log()? * options.deg as f64)?;

        if let Some(gate_q) = &self.gate_q {
            logits = logits.broadcast_add(gate_q)?;
        }
        if let Some(gate_k) = &self.gate_k {
            logits = logits.broadcast_sub(&gate_k.narrow(D::Minus1, start, len)?)?;
        }
        if options.causal {
            let mask = build_causal_block_mask(dot.device(), q_len, k_len, start, len)?;
            logits = logits.broadcast_add(&mask)?;
        }

        let signs = if options.deg % 2 == 1 {
            Some(sign_of(&dot)?)
        } else {
            None
        };
        Ok((logits, signs))
    }

    fn finish(
        &self,
        output: Tensor,
        rowmax: Tensor,
        options: &BlockOptions,
    ) -> candle_core::Result<BlockOutput> {
        let output = if options.normalize {
            normalize_output(&output)?
        } else {
            output
        };
        Ok(BlockOutput {
            output: output.transpose(1, 2)?.contiguous()?,
            rowmax: rowmax.squeeze(D::Minus1)?.transpose(1, 2)?.contiguous()?,
        })
    }
}

/// Materialised attention block.
///
/// `q` is `[b, m, h, d]`, `k` is `[b, n, h, d]`, `v` is `[b, n, h, e]`; gates
/// are `[b, m, h]` and `[b, n, h]`. All inputs must be `f32` with matching heads.
pub fn attention_exact(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    gate_q: Option<&Tensor>,
    gate_k: Option<&Tensor>,
    options: &BlockOptions,
) -> candle_core::Result<BlockOutput> {
    let views = HeadMajor::new(q, k, v, gate_q, gate_k)?;
    let (_, _, k_len, _) = views.k.dims4()?;

    let (logits, signs) = views.logits(0, k_len, options)?;
    let rowmax = logits.max_keepdim(D::Minus1)?.detach();
    let mut weights = logits.broadcast_sub(&rowmax)?.exp()?;
    if let Some(signs) = signs {
        weights = (weights * signs)?;
    }
    let output = weights.matmul(&views.v)?;

    views.finish(output, rowmax, options)
}

/// Key-block streaming attention with an online row max.
///
/// Produces the same result as [`attention_exact`] up to floating point
/// rounding while only materialising `[m, key_block]` scores at a time.
pub fn attention_streaming(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    gate_q: Option<&Tensor>,
    gate_k: Option<&Tensor>,
    options: &BlockOptions,
    key_block: usize,
) -> candle_core::Result<BlockOutput> {
    if key_block == 0 {
        candle_core::bail!("key_block must be greater than 0");
    }
    let views = HeadMajor::new(q, k, v, gate_q, gate_k)?;
    let (batch, heads, q_len, _) = views.q.dims4()?;
    let (_, _, k_len, value_dim) = views.v.dims4()?;
    let device = views.q.device();

    let mut running_max = Tensor::full(ROWMAX_FLOOR, (batch, heads, q_len, 1), device)?;
    let mut acc = Tensor::zeros((batch, heads, q_len, value_dim), views.v.dtype(), device)?;

    for start in (0..k_len).step_by(key_block) {
        if options.causal && block_fully_masked(q_len, k_len, start) {
            break;
        }
        let len = key_block.min(k_len - start);
        let (logits, signs) = views.logits(start, len, options)?;

        let block_max = logits.max_keepdim(D::Minus1)?.detach();
        let new_max = running_max.maximum(&block_max)?;
        let correction = (running_max - &new_max)?.exp()?;

        let mut weights = logits.broadcast_sub(&new_max)?.exp()?;
        if let Some(signs) = signs {
            weights = (weights * signs)?;
        }
        let v_block = views.v.narrow(2, start, len)?.contiguous()?;
        acc = (acc.broadcast_mul(&correction)? + weights.matmul(&v_block)?)?;
        running_max = new_max;
    }

    views.finish(acc, running_max, options)
}
