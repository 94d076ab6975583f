//! Builders for causal attention masks.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and shape
//! `[batch, num_heads, q_len, k_len]`. Entries are `0.0` where attention is
//! permitted and `fill` strictly above the main diagonal.

use candle_core::{Device, Result, Tensor};

/// Construct an additive causal mask for the supplied sequence dimensions.
///
/// Query `i` may attend to key `j` only when `j <= i`; both axes start at
/// position zero, so keys beyond `q_len` stay masked for every query.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
    fill: f32,
) -> Result<Tensor> {
    let total = batch * num_heads * q_len * k_len;
    let mut data = vec![0f32; total];

    for b in 0..batch {
        for h in 0..num_heads {
            for q in 0..q_len {
                let row_start = ((((b * num_heads) + h) * q_len) + q) * k_len;
                for k in (q + 1)..k_len {
                    data[row_start + k] = fill;
                }
            }
        }
    }

    Tensor::from_vec(data, (batch, num_heads, q_len, k_len), device)
}
