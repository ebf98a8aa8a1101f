//! Whole-sequence quadratic power attention.
//!
//! Materialises every query-key pair. It serves as the baseline the chunked
//! path is validated against and as the fallback for short sequences.

pub mod quadratic;

pub use quadratic::QuadraticAttention;
pub(crate) use quadratic::quadratic_forward;
