//! Reference attention built from primitive tensor ops.
//!
//! The exact path prioritises numerical fidelity and mirrors the semantics
//! described by the [`Attention`](crate::core::Attention) trait. It never
//! fuses anything: scores, mask and softmax are materialised so candle's
//! autodiff can differentiate every step.

use std::sync::OnceLock;

use candle_core::{DType, Result as CandleResult, Tensor, D};
use candle_nn::ops::softmax;

use crate::core::{validate_qkv, Attention, AttentionError, Config};
use crate::masks::{build_causal_mask, CAUSAL_FILL};

/// Numerically stable, portable attention evaluator.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init causal={} dtype={:?}",
                config.causal,
                q.dtype()
            );
        }

        if config.dropout()? > 0.0 {
            return Err(AttentionError::InvalidConfig(
                "the reference path is deterministic; dropout must be disabled".to_string(),
            ));
        }
        attention_naive(q, k, v, config.causal)
    }
}

/// Scaled dot-product attention on `[batch, seq_len, heads, head_dim]` tensors.
///
/// Reduced precision inputs are promoted to `f32` for the whole computation
/// and the result is cast back to the input dtype. With `causal` set, scores
/// of keys after the query position receive a `-1e4` bias before softmax.
pub fn attention_naive(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    causal: bool,
) -> Result<Tensor, AttentionError> {
    let (batch, seq_len, heads, head_dim) = validate_qkv(q, k, v)?;
    let dtype = q.dtype();

    let q = cast_tensor(q, DType::F32)?;
    let k = cast_tensor(k, DType::F32)?;
    let v = cast_tensor(v, DType::F32)?;

    // [batch, heads, seq_len, head_dim]
    let qt = q.transpose(1, 2)?.contiguous()?;
    let kt = k.transpose(1, 2)?.contiguous()?;
    let vt = v.transpose(1, 2)?.contiguous()?;

    let scale = 1.0 / (head_dim as f64).sqrt();
    let scores = qt
        .matmul(&kt.transpose(2, 3)?.contiguous()?)?
        .mul_scalar(scale)?;
    let scores = if causal {
        let mask = build_causal_mask(q.device(), batch, heads, seq_len, seq_len, CAUSAL_FILL)?;
        scores.add(&mask)?
    } else {
        scores
    };

    let probs = softmax(&scores, D::Minus1)?;
    let output = probs.matmul(&vt)?;
    let output = cast_tensor(&output, dtype)?;
    Ok(output.transpose(1, 2)?.contiguous()?)
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> CandleResult<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

trait MulScalarExt {
    fn mul_scalar(&self, value: f64) -> CandleResult<Tensor>;
}

impl MulScalarExt for Tensor {
    fn mul_scalar(&self, value: f64) -> CandleResult<Tensor> {
        self.affine(value, 0.0)
    }
}
