//! Builders for causal attention masks.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and shape
//! `[q_len, block_len]`, broadcastable against `[batch, heads, q_len, k_len]`
//! scores. Entries are `0.0` where attention is permitted and
//! `f32::NEG_INFINITY` otherwise.

use candle_core::{Device, Result, Tensor};

/// Construct a causal mask for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn build_causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    build_causal_block_mask(device, q_len, k_len, 0, k_len)
}

/// Columns `[key_start, key_start + block_len)` of the causal mask for
/// `q_len` queries over `k_len` keys.
pub fn build_causal_block_mask(
    device: &Device,
    q_len: usize,
    k_len: usize,
    key_start: usize,
    block_len: usize,
) -> Result<Tensor> {
    let mut data = vec![0f32; q_len * block_len];

    let offset = k_len.saturating_sub(q_len);

    for q in 0..q_len {
        let row_start = q * block_len;
        let max_k = q + offset;
        for k in 0..block_len {
            if key_start + k > max_k {
                data[row_start + k] = f32::NEG_INFINITY;
            }
        }
    }

    Tensor::from_vec(data, (q_len, block_len), device)
}

/// True when every entry of the key block lies in the future of every query.
pub fn block_fully_masked(q_len: usize, k_len: usize, key_start: usize) -> bool {
    let last_visible = q_len.saturating_sub(1) + k_len.saturating_sub(q_len);
    key_start > last_visible
}
