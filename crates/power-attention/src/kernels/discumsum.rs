//! Discounted cumulative sum over the chunk axis.
//!
//! ```text
//! out[0]     = 0
//! out[i + 1] = exp(g[i]) * out[i] + s[i]
//! ```
//!
//! `out` has one more entry than `s`; `out[i]` summarises strictly preceding
//! chunks and callers drop the trailing entry. The combine
//! `(a1, x1) . (a2, x2) = (a1 + a2, exp(a2) * x1 + x2)` is associative, so a
//! tree scan produces the same values in a different summation order.

use candle_core::{Result, Tensor};

fn check_shapes(states: &Tensor, log_g: &Tensor) -> Result<(usize, usize, usize)> {
    let (batch, chunks, heads, _, _) = states.dims5()?;
    let (gb, gn, gh) = log_g.dims3()?;
    if (gb, gn, gh) != (batch, chunks, heads) {
        candle_core::bail!(
            "discumsum decay shape [{gb}, {gn}, {gh}] does not match states [{batch}, {chunks}, {heads}, ..]"
        );
    }
    if chunks == 0 {
        candle_core::bail!("discumsum requires at least one chunk");
    }
    Ok((batch, chunks, heads))
}

/// `[b, n, h]` decays as `[b, n, h, 1, 1]` multipliers.
fn decay_factors(log_g: &Tensor) -> Result<Tensor> {
    log_g.exp()?.unsqueeze(3)?.unsqueeze(4)
}

fn prepend_empty(scanned: &Tensor) -> Result<Tensor> {
    let zero = scanned.narrow(1, 0, 1)?.zeros_like()?;
    Tensor::cat(&[&zero, scanned], 1)
}

/// Left-to-right scan; fixed summation order.
///
/// `states` is `[b, n, h, D, e]`, `log_g` is `[b, n, h]`; returns `[b, n + 1, h, D, e]`.
pub fn discumsum_sequential(states: &Tensor, log_g: &Tensor) -> Result<Tensor> {
    let (_, chunks, _) = check_shapes(states, log_g)?;
    let decay = decay_factors(log_g)?;

    let mut acc = states.narrow(1, 0, 1)?.zeros_like()?;
    let mut outputs = Vec::with_capacity(chunks + 1);
    outputs.push(acc.clone());
    for i in 0..chunks {
        let local = states.narrow(1, i, 1)?;
        acc = (acc.broadcast_mul(&decay.narrow(1, i, 1)?)? + local)?;
        outputs.push(acc.clone());
    }
    Tensor::cat(&outputs, 1)
}

/// Hillis–Steele inclusive scan in `ceil(log2(n))` vectorised steps.
pub fn discumsum_tree(states: &Tensor, log_g: &Tensor) -> Result<Tensor> {
    let (_, chunks, _) = check_shapes(states, log_g)?;

    let mut values = states.clone();
    let mut decays = log_g.clone();
    let mut offset = 1;
    while offset < chunks {
        let kept = chunks - offset;
        let shifted_values = Tensor::cat(
            &[
                &values.narrow(1, 0, offset)?.zeros_like()?,
                &values.narrow(1, 0, kept)?,
            ],
            1,
        )?;
        let shifted_decays = Tensor::cat(
            &[
                &decays.narrow(1, 0, offset)?.zeros_like()?,
                &decays.narrow(1, 0, kept)?,
            ],
            1,
        )?;
        values = (shifted_values.broadcast_mul(&decay_factors(&decays)?)? + values)?;
        decays = (shifted_decays + decays)?;
        offset *= 2;
    }
    prepend_empty(&values)
}
