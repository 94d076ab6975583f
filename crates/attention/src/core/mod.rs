//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on tensors with layout
//! `[batch, seq_len, num_heads, head_dim]`. The output tensor mirrors the input
//! layout, and reductions accumulate in `f32` regardless of the incoming dtype
//! (`bf16`, `f16`, or `f32`).

pub mod config;
pub mod errors;
pub mod precision;

use candle_core::{DType, Tensor};

use crate::capability::KernelRequirement;

pub use config::Config;
pub use errors::{AttentionError, CheckError};
pub use precision::{Precision, Tolerance};

/// Unified interface for reference-style attention evaluators.
///
/// * `q`, `k`, and `v` share the layout `[batch, seq_len, num_heads, head_dim]`.
/// * The returned tensor mirrors the layout and dtype of `q`.
/// * Gradients, when requested, come from the tensor framework's autodiff.
pub trait Attention {
    /// Compute self-attention honouring [`Config::causal`].
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}

/// Interface for fused flash-attention kernels.
///
/// The signature follows the usual `(q, k, v, dropout, causal, return_softmax)`
/// contract: the output matches `q` in shape and dtype, and the optional second
/// tensor is the `[batch, num_heads, q_len, k_len]` softmax matrix, present
/// only when [`Config::return_softmax`] is set.
pub trait FlashAttention {
    /// Short identifier used in logs and reports.
    fn name(&self) -> &'static str;

    /// Device generation and math library the kernel needs.
    fn requirement(&self) -> KernelRequirement;

    fn flash_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<(Tensor, Option<Tensor>), AttentionError>;
}

/// Check the shared `q`/`k`/`v` contract and return `(batch, seq_len, heads, head_dim)`.
pub fn validate_qkv(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
) -> Result<(usize, usize, usize, usize), AttentionError> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::InvalidShape {
            context: "q, k, v must reside on the same device".to_string(),
        });
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::UnsupportedDType {
            requested: format!(
                "mixed dtypes q={:?} k={:?} v={:?}",
                dtype,
                k.dtype(),
                v.dtype()
            ),
        });
    }
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }

    let dims = q.dims4().map_err(|_| AttentionError::InvalidShape {
        context: format!(
            "q must have shape [batch, seq_len, heads, head_dim], got {:?}",
            q.dims()
        ),
    })?;
    for (name, tensor) in [("k", k), ("v", v)] {
        if tensor.dims() != q.dims() {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "{name} shape mismatch: expected {:?} got {:?}",
                    q.dims(),
                    tensor.dims()
                ),
            });
        }
    }
    Ok(dims)
}
