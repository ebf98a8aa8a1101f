#![allow(dead_code)]

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use power_attention::inputs::{InputSpec, SampleInputs};

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let a = a.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let b = b.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    anyhow::ensure!(a.len() == b.len(), "length mismatch {} vs {}", a.len(), b.len());
    Ok(a.iter()
        .zip(&b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max))
}

pub fn max_abs(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?
        .iter()
        .fold(0.0f32, |acc, x| acc.max(x.abs())))
}

/// Max absolute difference scaled by the largest reference magnitude.
pub fn max_rel_diff(got: &Tensor, reference: &Tensor) -> Result<f32> {
    Ok(max_abs_diff(got, reference)? / max_abs(reference)?.max(1e-6))
}

pub fn spec(seq_len: usize, q_heads: usize, kv_heads: usize, head_dim: usize, value_dim: usize) -> InputSpec {
    InputSpec {
        batch: 2,
        seq_len,
        q_heads,
        kv_heads,
        head_dim,
        value_dim,
        dtype: DType::F32,
        gating: true,
    }
}

pub fn sample(spec: &InputSpec, seed: u64) -> Result<SampleInputs> {
    Ok(SampleInputs::generate(spec, seed, &Device::Cpu)?)
}

/// Same inputs with non-negative queries and keys, so odd degrees have a
/// normaliser bounded away from zero.
pub fn positive(inputs: &SampleInputs) -> Result<SampleInputs> {
    Ok(SampleInputs {
        q: inputs.q.abs()?,
        k: inputs.k.abs()?,
        v: inputs.v.clone(),
        log_g: inputs.log_g.clone(),
    })
}
