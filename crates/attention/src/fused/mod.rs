//! Optimised fused attention kernels.
//!
//! These implementations are only compiled when the `fused` feature is
//! enabled. [`TiledFlashAttention`] runs on the host CPU: it tiles the key axis,
//! keeps per-row softmax statistics instead of the score matrix, and ships its
//! own backward pass through a candle [`CustomOp3`](candle_core::CustomOp3).

mod kernel;
mod op;

use candle_core::{DType, Tensor};

use crate::capability::{KernelRequirement, CPU_TILED};
use crate::core::{validate_qkv, AttentionError, Config, FlashAttention};

use kernel::{Geometry, KernelParams};
use op::FlashAttnOp;

/// Default number of keys folded into the running softmax per step.
pub const DEFAULT_BLOCK_K: usize = 32;

/// Key-tiled flash attention for CPU tensors.
#[derive(Debug, Clone)]
pub struct TiledFlashAttention {
    block_k: usize,
    dropout_seed: u64,
    requirement: KernelRequirement,
}

impl TiledFlashAttention {
    pub fn new() -> Self {
        Self {
            block_k: DEFAULT_BLOCK_K,
            dropout_seed: 0,
            requirement: CPU_TILED,
        }
    }

    pub fn with_block_size(mut self, block_k: usize) -> Self {
        self.block_k = block_k.max(1);
        self
    }

    /// Seed for the dropout keep/drop decisions.
    pub fn with_dropout_seed(mut self, seed: u64) -> Self {
        self.dropout_seed = seed;
        self
    }

    /// Advertise a different device requirement to the capability gate.
    pub fn with_requirement(mut self, requirement: KernelRequirement) -> Self {
        self.requirement = requirement;
        self
    }
}

impl Default for TiledFlashAttention {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashAttention for TiledFlashAttention {
    fn name(&self) -> &'static str {
        "tiled"
    }

    fn requirement(&self) -> KernelRequirement {
        self.requirement
    }

    fn flash_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<(Tensor, Option<Tensor>), AttentionError> {
        let (batch, seq_len, heads, head_dim) = validate_qkv(q, k, v)?;
        if !q.device().is_cpu() {
            return Err(AttentionError::UnsupportedDevice {
                location: format!("{:?}", q.device().location()),
            });
        }

        let params = KernelParams {
            causal: config.causal,
            dropout_p: config.dropout()?,
            seed: self.dropout_seed,
            block_k: self.block_k,
        };
        let dtype = q.dtype();

        let q32 = q.to_dtype(DType::F32)?.contiguous()?;
        let k32 = k.to_dtype(DType::F32)?.contiguous()?;
        let v32 = v.to_dtype(DType::F32)?.contiguous()?;
        let out = q32.apply_op3(&k32, &v32, FlashAttnOp::new(params))?;

        let softmax = if config.return_softmax {
            let geo = Geometry {
                batch,
                seq_len,
                heads,
                head_dim,
            };
            let q_data = q32.flatten_all()?.to_vec1::<f32>()?;
            let k_data = k32.flatten_all()?.to_vec1::<f32>()?;
            let matrix = kernel::probabilities(&geo, &params, &q_data, &k_data);
            let matrix = Tensor::from_vec(matrix, (batch, heads, seq_len, seq_len), q.device())?;
            Some(matrix.to_dtype(dtype)?)
        } else {
            None
        };

        Ok((out.to_dtype(dtype)?, softmax))
    }
}
