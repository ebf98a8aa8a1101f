//! Forward-only output normalisation.
//!
//! Each row of the last dimension is recentred and divided by its root mean
//! square. The gradient of this op is not implemented; back-propagating
//! through it returns an error instead of silently producing zeros.

use candle_core::{CpuStorage, CustomOp1, Layout, Result, Shape, Tensor};

use crate::core::AttentionError;

const NORM_EPS: f32 = 1e-7;

#[derive(Debug, Clone, Copy)]
struct OutputNorm;

impl CustomOp1 for OutputNorm {
    fn name(&self) -> &'static str {
        "power-attention-output-norm"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let data = match storage {
            CpuStorage::F32(data) => data,
            _ => candle_core::bail!("output normalisation expects f32 storage"),
        };
        let (start, end) = match layout.contiguous_offsets() {
            Some(offsets) => offsets,
            None => candle_core::bail!("output normalisation requires a contiguous input"),
        };
        let row = match layout.dims().last() {
            Some(&row) if row > 0 => row,
            _ => candle_core::bail!("output normalisation requires a non-empty last dim"),
        };

        let mut out = Vec::with_capacity(end - start);
        for chunk in data[start..end].chunks(row) {
            let mean = chunk.iter().sum::<f32>() / row as f32;
            let var = chunk.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / row as f32;
            let scale = 1.0 / (var + NORM_EPS).sqrt();
            out.extend(chunk.iter().map(|x| (x - mean) * scale));
        }

        Ok((CpuStorage::F32(out), layout.shape().clone()))
    }

    fn bwd(&self, _arg: &Tensor, _res: &Tensor, _grad_res: &Tensor) -> Result<Option<Tensor>> {
        Err(candle_core::Error::wrap(AttentionError::Unimplemented {
            feature: "backward pass of output normalisation",
        }))
    }
}

/// Recentre and variance-normalise the last dimension of an `f32` tensor.
pub fn normalize_output(output: &Tensor) -> Result<Tensor> {
    output.contiguous()?.apply_op1(OutputNorm)
}
