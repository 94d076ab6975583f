//! Mask utilities shared by attention implementations.
//!
//! All masks produced here are additive tensors with dtype `f32`, shaped
//! `[batch, num_heads, q_len, k_len]`. Masked entries carry a large negative
//! bias rather than `-inf`, so softmax assigns them a vanishing but finite
//! weight and fully masked rows stay well defined.

pub mod causal;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Bias added to scores of future positions.
pub const CAUSAL_FILL: f32 = -1e4;

pub use causal::build_causal_mask;
