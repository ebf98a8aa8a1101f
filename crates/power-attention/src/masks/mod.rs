//! Mask utilities shared by attention kernels.
//!
//! All masks produced here are additive tensors with dtype `f32`. Values are
//! either `0.0` (keep) or `f32::NEG_INFINITY` (discard), so masked logits
//! vanish after exponentiation.

pub mod causal;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::{block_fully_masked, build_causal_block_mask, build_causal_mask};
