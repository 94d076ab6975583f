//! Causal self-attention correctness tooling for the transformer project.
//!
//! The crate pairs a fused flash-attention kernel with an exact reference
//! evaluator and checks that both agree, forward and backward, across `f32`,
//! `f16` and `bf16`. Every public entry point takes `Q`, `K` and `V` laid out
//! as `[batch, seq_len, num_heads, head_dim]`; all three share shape and dtype.
//! Reductions run in `f32` and outputs come back in the input dtype.
//!
//! * [`reference`] computes attention from primitive candle ops so gradients
//!   come from candle's autodiff.
//! * [`fused`] holds the tiled kernel that never materialises the score
//!   matrix and carries its own backward pass.
//! * [`capability`] decides whether a fused kernel may run on the current
//!   device; unsupported devices skip the comparison rather than fail it.
//! * [`harness`] drives one comparison case or a whole suite.

pub mod capability;
pub mod compare;
pub mod core;
pub mod harness;
pub mod masks;
pub mod reference;
pub mod report;

#[cfg(feature = "fused")]
pub mod fused;

pub use core::{
    Attention, AttentionError, CheckError, Config, FlashAttention, Precision, Tolerance,
};
