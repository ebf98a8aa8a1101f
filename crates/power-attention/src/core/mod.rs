//! Core traits and types shared across power attention implementations.
//!
//! Implementations operate on tensors with layout
//! `[batch, seq_len, n_heads, head_dim]`. Key/value heads may be fewer than
//! query heads by an integer ratio. The output mirrors the query layout with
//! the value width as its last dimension, and all reductions accumulate in
//! `f32` regardless of the incoming dtype (`bf16`, `f16`, or `f32`).

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{BackendSelection, Config};
pub use errors::AttentionError;

/// Unified interface for power attention variants.
///
/// * `q` is `[batch, seq_len, q_heads, head_dim]`; `k` and `v` are
///   `[batch, seq_len, kv_heads, head_dim]` and `[batch, seq_len, kv_heads, value_dim]`.
/// * `log_g`, when present, is an `f32` tensor `[batch, seq_len, kv_heads]` of
///   per-position log decays.
/// * The returned tensor is `[batch, seq_len, q_heads, value_dim]` in the dtype of `q`.
/// * Attention is always causal.
pub trait Attention {
    /// Compute gated causal power attention.
    fn compute_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        log_g: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
