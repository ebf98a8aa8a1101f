//! Chunked, gated power attention for candle.
//!
//! Power attention replaces the softmax similarity with a positive integer
//! power of the query-key inner product,
//!
//! ```text
//! y_i = sum_{j <= i} (q_i . k_j)^deg exp(G_i - G_j) v_j / sum_{j <= i} (q_i . k_j)^deg exp(G_i - G_j)
//! ```
//!
//! where `G` is the cumulative sum of an optional per-position log gate. The
//! kernel `(q . k)^deg` factors through a symmetric power feature map, so the
//! sequence can be split into chunks that exchange a fixed-size state. Cost
//! is quadratic in the chunk length and linear in the number of chunks.
//!
//! Tensors use the layout `[batch, seq_len, heads, features]`. Key/value heads
//! may be fewer than query heads by an integer ratio, values may be wider or
//! narrower than queries, and inputs may be `bf16`, `f16` or `f32`. The gate
//! is always `f32` and all internal arithmetic runs in `f32`.
//!
//! [`QuadraticAttention`] evaluates every pair directly and is the baseline
//! [`ChunkedAttention`] / [`power_full`] are validated against.

pub mod checks;
pub mod chunked;
pub mod core;
pub mod inputs;
pub mod kernels;
pub mod masks;
pub mod reference;

pub use crate::chunked::{linear_full, power_full, ChunkedAttention};
pub use crate::core::{Attention, AttentionError, BackendSelection, Config};
pub use crate::reference::QuadraticAttention;
