//! Symmetric power feature map.
//!
//! For a head dimension `d` and degree `p`, the map sends `x` to one feature
//! per multiset `i1 <= ... <= ip` of feature indices:
//!
//! ```text
//! phi(x)[i1..ip] = sqrt(p! / prod(mult!)) * x[i1] * ... * x[ip]
//! ```
//!
//! By the multinomial theorem `phi(x) . phi(y) = (x . y)^p`, so a degree-`p`
//! kernel becomes an ordinary inner product in `C(d + p - 1, p)` dimensions.

use candle_core::{Result, Tensor, D};

use crate::core::AttentionError;

/// Number of expanded features for `head_dim` and `deg`.
pub fn expanded_dim(head_dim: usize, deg: usize) -> usize {
    // C(d + p - 1, p) computed incrementally; each prefix is an exact binomial.
    let mut acc: usize = 1;
    for i in 1..=deg {
        acc = acc * (head_dim + i - 1) / i;
    }
    acc
}

/// Precomputed gather indices and coefficients for one `(head_dim, deg)`.
#[derive(Debug, Clone)]
pub struct SymmetricPowerMap {
    head_dim: usize,
    deg: usize,
    /// `indices[f][j]` is the feature gathered by factor `f` of output `j`.
    indices: Vec<Vec<u32>>,
    coefficients: Vec<f32>,
}

impl SymmetricPowerMap {
    pub fn new(head_dim: usize, deg: usize) -> std::result::Result<Self, AttentionError> {
        if deg == 0 {
            return Err(AttentionError::InvalidConfig(vec![
                "deg must be a positive integer".to_string(),
            ]));
        }
        if head_dim == 0 {
            return Err(AttentionError::invalid_shape("head_dim must be non-zero"));
        }
        if head_dim > u32::MAX as usize {
            return Err(AttentionError::invalid_shape("head_dim exceeds u32 range"));
        }

        let dim = expanded_dim(head_dim, deg);
        let mut indices = vec![Vec::with_capacity(dim); deg];
        let mut coefficients = Vec::with_capacity(dim);
        let log_deg_factorial = log_factorial(deg);

        let mut tuple = vec![0usize; deg];
        loop {
            for (factor, &feature) in tuple.iter().enumerate() {
                indices[factor].push(feature as u32);
            }
            let mut log_denominator = 0.0f64;
            let mut run = 1usize;
            for pair in tuple.windows(2) {
                if pair[0] == pair[1] {
                    run += 1;
                } else {
                    log_denominator += log_factorial(run);
                    run = 1;
                }
            }
            log_denominator += log_factorial(run);
            coefficients.push((0.5 * (log_deg_factorial - log_denominator)).exp() as f32);

            if !advance_multiset(&mut tuple, head_dim) {
                break;
            }
        }

        debug_assert_eq!(coefficients.len(), dim);
        Ok(Self {
            head_dim,
            deg,
            indices,
            coefficients,
        })
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn deg(&self) -> usize {
        self.deg
    }

    pub fn expanded_dim(&self) -> usize {
        self.coefficients.len()
    }

    /// Expand the last dimension of an `f32` tensor from `head_dim` to the
    /// expanded dimension.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let last = x.dim(D::Minus1)?;
        if last != self.head_dim {
            candle_core::bail!(
                "symmetric power map expects last dim {}, got {last}",
                self.head_dim
            );
        }
        let device = x.device();
        let x = x.contiguous()?;
        let dim = self.expanded_dim();

        let mut out: Option<Tensor> = None;
        for factor in &self.indices {
            let ids = Tensor::from_slice(factor.as_slice(), dim, device)?;
            let gathered = x.index_select(&ids, D::Minus1)?;
            out = Some(match out {
                Some(acc) => (acc * gathered)?,
                None => gathered,
            });
        }
        let out = match out {
            Some(out) => out,
            None => candle_core::bail!("symmetric power map has no factors"),
        };

        let coefficients = Tensor::from_slice(self.coefficients.as_slice(), dim, device)?
            .to_dtype(out.dtype())?;
        out.broadcast_mul(&coefficients)
    }
}

/// Step to the next non-decreasing tuple in lexicographic order.
fn advance_multiset(tuple: &mut [usize], head_dim: usize) -> bool {
    let Some(pos) = tuple.iter().rposition(|&feature| feature + 1 < head_dim) else {
        return false;
    };
    let next = tuple[pos] + 1;
    for slot in &mut tuple[pos..] {
        *slot = next;
    }
    true
}

fn log_factorial(n: usize) -> f64 {
    (2..=n).map(|i| (i as f64).ln()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Result};

    #[test]
    fn expanded_dim_matches_binomials() {
        assert_eq!(expanded_dim(32, 1), 32);
        assert_eq!(expanded_dim(32, 2), 528);
        assert_eq!(expanded_dim(4, 3), 20);
        assert_eq!(expanded_dim(64, 2), 2080);
        assert_eq!(expanded_dim(1, 5), 1);
    }

    #[test]
    fn map_sizes_match_expanded_dim() -> anyhow::Result<()> {
        for (d, p) in [(3, 1), (3, 2), (5, 3), (2, 4)] {
            let map = SymmetricPowerMap::new(d, p)?;
            assert_eq!(map.expanded_dim(), expanded_dim(d, p));
        }
        Ok(())
    }

    #[test]
    fn inner_product_reproduces_power_kernel() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let x: Vec<f32> = vec![0.3, -1.2, 0.7, 2.0, -0.4];
        let y: Vec<f32> = vec![1.1, 0.5, -0.9, 0.25, 0.6];
        let dot: f32 = x.iter().zip(&y).map(|(a, b)| a * b).sum();
        let xs = Tensor::from_vec(x, (1, 5), &device)?;
        let ys = Tensor::from_vec(y, (1, 5), &device)?;

        for deg in 1..=4 {
            let map = SymmetricPowerMap::new(5, deg)?;
            let fx = map.apply(&xs)?;
            let fy = map.apply(&ys)?;
            let inner = (fx * fy)?.sum_all()?.to_scalar::<f32>()?;
            let expected = dot.powi(deg as i32);
            assert!(
                (inner - expected).abs() <= 1e-4 * expected.abs().max(1.0),
                "deg {deg}: {inner} vs {expected}"
            );
        }
        Ok(())
    }

    #[test]
    fn map_is_homogeneous() -> Result<()> {
        let device = Device::Cpu;
        let map = SymmetricPowerMap::new(3, 2).map_err(candle_core::Error::wrap)?;
        let x = Tensor::new(&[[0.5f32, -1.0, 2.0]], &device)?;
        let scaled = map.apply(&(&x * 3.0)?)?;
        let expected = (map.apply(&x)? * 9.0)?;
        let diff = (scaled - expected)?.abs()?.flatten_all()?.to_vec1::<f32>()?;
        assert!(diff.iter().all(|d| *d < 1e-4));
        Ok(())
    }

    #[test]
    fn rejects_zero_degree() {
        assert!(SymmetricPowerMap::new(4, 0).is_err());
    }
}
