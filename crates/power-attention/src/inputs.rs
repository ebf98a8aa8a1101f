//! Deterministic sample inputs for tests and the correctness bench.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::ops::sigmoid;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// `sigmoid(GATE_BIAS) ~= 0.999`, a slow per-step decay.
const GATE_BIAS: f32 = 6.906768;
const GATE_NOISE: f32 = 0.5;

/// Shape and dtype of a generated problem.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    pub batch: usize,
    pub seq_len: usize,
    pub q_heads: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub value_dim: usize,
    pub dtype: DType,
    pub gating: bool,
}

impl Default for InputSpec {
    fn default() -> Self {
        Self {
            batch: 2,
            seq_len: 64,
            q_heads: 4,
            kv_heads: 4,
            head_dim: 16,
            value_dim: 16,
            dtype: DType::F32,
            gating: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleInputs {
    /// `[batch, seq_len, q_heads, head_dim]`
    pub q: Tensor,
    /// `[batch, seq_len, kv_heads, head_dim]`
    pub k: Tensor,
    /// `[batch, seq_len, kv_heads, value_dim]`
    pub v: Tensor,
    /// `f32` `[batch, seq_len, kv_heads]` log decays, when gating is enabled.
    pub log_g: Option<Tensor>,
}

impl SampleInputs {
    /// Unit-variance uniform values; queries and keys are scaled by
    /// `head_dim^-1/4` so dot products stay near unit scale.
    pub fn generate(spec: &InputSpec, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let qk_scale = (spec.head_dim as f32).powf(-0.25);
        let rows = spec.batch * spec.seq_len;

        let q = uniform(
            &mut rng,
            (spec.batch, spec.seq_len, spec.q_heads, spec.head_dim),
            rows * spec.q_heads * spec.head_dim,
            qk_scale,
            device,
        )?;
        let k = uniform(
            &mut rng,
            (spec.batch, spec.seq_len, spec.kv_heads, spec.head_dim),
            rows * spec.kv_heads * spec.head_dim,
            qk_scale,
            device,
        )?;
        let v = uniform(
            &mut rng,
            (spec.batch, spec.seq_len, spec.kv_heads, spec.value_dim),
            rows * spec.kv_heads * spec.value_dim,
            1.0,
            device,
        )?;

        let log_g = if spec.gating {
            let noise: Vec<f32> = (0..rows * spec.kv_heads)
                .map(|_| GATE_BIAS + rng.gen_range(-GATE_NOISE..GATE_NOISE))
                .collect();
            let logits = Tensor::from_vec(noise, (spec.batch, spec.seq_len, spec.kv_heads), device)?;
            Some(sigmoid(&logits)?.log()?)
        } else {
            None
        };

        Ok(Self {
            q: q.to_dtype(spec.dtype)?,
            k: k.to_dtype(spec.dtype)?,
            v: v.to_dtype(spec.dtype)?,
            log_g,
        })
    }
}

fn uniform(
    rng: &mut StdRng,
    shape: (usize, usize, usize, usize),
    len: usize,
    scale: f32,
    device: &Device,
) -> Result<Tensor> {
    let bound = 3f32.sqrt();
    let data: Vec<f32> = (0..len)
        .map(|_| rng.gen_range(-bound..bound) * scale)
        .collect();
    Tensor::from_vec(data, shape, device)
}
