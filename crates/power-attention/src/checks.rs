//! Boundary validation shared by every entry point.
//!
//! All checks run before any numeric work so contract violations fail fast
//! and never get silently coerced.

use candle_core::{DType, Tensor};

use crate::core::AttentionError;

/// Input dtypes accepted at the boundary.
pub const SUPPORTED_DTYPES: [DType; 3] = [DType::F16, DType::BF16, DType::F32];

/// Resolved problem dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    pub batch: usize,
    pub seq_len: usize,
    pub q_heads: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub value_dim: usize,
    pub dtype: DType,
}

impl AttentionShape {
    pub fn head_ratio(&self) -> usize {
        self.q_heads / self.kv_heads
    }
}

/// Validates `q`, `k`, `v` and the optional gate against the layout contract.
pub fn validate_inputs(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    log_g: Option<&Tensor>,
) -> Result<AttentionShape, AttentionError> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::invalid_shape(
            "q, k, v must reside on the same device",
        ));
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::UnsupportedDType {
            requested: format!(
                "q, k, v must share a dtype, got {:?}/{:?}/{:?}",
                dtype,
                k.dtype(),
                v.dtype()
            ),
        });
    }
    if !SUPPORTED_DTYPES.contains(&dtype) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }

    let (batch, seq_len, q_heads, head_dim) = q.dims4().map_err(|_| {
        AttentionError::invalid_shape(format!(
            "q must have shape [batch, seq_len, heads, head_dim], got {:?}",
            q.dims()
        ))
    })?;
    let (kb, kt, kv_heads, kd) = k.dims4().map_err(|_| {
        AttentionError::invalid_shape(format!(
            "k must have shape [batch, seq_len, heads, head_dim], got {:?}",
            k.dims()
        ))
    })?;
    let (vb, vt, vh, value_dim) = v.dims4().map_err(|_| {
        AttentionError::invalid_shape(format!(
            "v must have shape [batch, seq_len, heads, value_dim], got {:?}",
            v.dims()
        ))
    })?;

    if kb != batch || kt != seq_len || kd != head_dim {
        return Err(AttentionError::invalid_shape(format!(
            "k shape mismatch: expected [{batch}, {seq_len}, ?, {head_dim}] got [{kb}, {kt}, {kv_heads}, {kd}]"
        )));
    }
    if vb != batch || vt != seq_len || vh != kv_heads {
        return Err(AttentionError::invalid_shape(format!(
            "v shape mismatch: expected [{batch}, {seq_len}, {kv_heads}, ?] got [{vb}, {vt}, {vh}, {value_dim}]"
        )));
    }
    if seq_len == 0 || head_dim == 0 || value_dim == 0 {
        return Err(AttentionError::invalid_shape(
            "sequence length, head_dim and value_dim must be non-zero",
        ));
    }
    if kv_heads == 0 || q_heads % kv_heads != 0 {
        return Err(AttentionError::HeadRatio {
            query_heads: q_heads,
            kv_heads,
        });
    }

    if let Some(gate) = log_g {
        if !device.same_device(gate.device()) {
            return Err(AttentionError::invalid_shape(
                "log_g must reside on the same device as q",
            ));
        }
        if gate.dtype() != DType::F32 {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("log_g expects F32, got {:?}", gate.dtype()),
            });
        }
        if gate.dims() != [batch, seq_len, kv_heads].as_slice() {
            return Err(AttentionError::invalid_shape(format!(
                "log_g shape mismatch: expected [{batch}, {seq_len}, {kv_heads}] got {:?}",
                gate.dims()
            )));
        }
    }

    Ok(AttentionShape {
        batch,
        seq_len,
        q_heads,
        kv_heads,
        head_dim,
        value_dim,
        dtype,
    })
}
