//! Scalar kernels behind [`TiledFlashAttention`](super::TiledFlashAttention).
//!
//! All buffers are contiguous `f32` in `[batch, seq_len, heads, head_dim]`
//! order. The forward pass walks keys in blocks and folds each block into a
//! running max/sum (online softmax), so the full score row is never stored.
//! The backward pass recomputes the normalised probabilities one row at a
//! time.

/// Problem dimensions shared by `q`, `k`, `v` and the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub batch: usize,
    pub seq_len: usize,
    pub heads: usize,
    pub head_dim: usize,
}

impl Geometry {
    pub fn from_dims(dims: &[usize]) -> Option<Self> {
        match *dims {
            [batch, seq_len, heads, head_dim] => Some(Self {
                batch,
                seq_len,
                heads,
                head_dim,
            }),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.batch * self.seq_len * self.heads * self.head_dim
    }

    /// Offset of the `head_dim` vector at `(b, s, h)`.
    fn row(&self, b: usize, s: usize, h: usize) -> usize {
        ((b * self.seq_len + s) * self.heads + h) * self.head_dim
    }

    fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct KernelParams {
    pub causal: bool,
    pub dropout_p: f32,
    pub seed: u64,
    pub block_k: usize,
}

impl KernelParams {
    /// One past the last key visible from query `i`.
    fn key_end(&self, i: usize, seq_len: usize) -> usize {
        if self.causal {
            (i + 1).min(seq_len)
        } else {
            seq_len
        }
    }

    /// Multiplier applied to the attention weight `(b, h, i, j)`: zero when
    /// dropped, `1 / (1 - p)` when kept.
    fn keep_scale(&self, geo: &Geometry, b: usize, h: usize, i: usize, j: usize) -> f32 {
        if self.dropout_p == 0.0 {
            return 1.0;
        }
        let index = (((b * geo.heads + h) * geo.seq_len + i) * geo.seq_len + j) as u64;
        let bits = splitmix64(self.seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let uniform = (bits >> 40) as f32 / (1u64 << 24) as f32;
        if uniform >= self.dropout_p {
            1.0 / (1.0 - self.dropout_p)
        } else {
            0.0
        }
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn forward(
    geo: &Geometry,
    params: &KernelParams,
    q: &[f32],
    k: &[f32],
    v: &[f32],
) -> Vec<f32> {
    let d = geo.head_dim;
    let scale = geo.scale();
    let block = params.block_k.max(1);
    let mut out = vec![0f32; geo.len()];
    let mut acc = vec![0f32; d];
    let mut tile = vec![0f32; block];

    for b in 0..geo.batch {
        for h in 0..geo.heads {
            for i in 0..geo.seq_len {
                let q_row = &q[geo.row(b, i, h)..][..d];
                let end = params.key_end(i, geo.seq_len);
                let mut running_max = f32::NEG_INFINITY;
                let mut running_sum = 0f32;
                acc.fill(0.0);

                for start in (0..end).step_by(block) {
                    let stop = (start + block).min(end);
                    let mut tile_max = f32::NEG_INFINITY;
                    for (slot, j) in tile.iter_mut().zip(start..stop) {
                        *slot = dot(q_row, &k[geo.row(b, j, h)..][..d]) * scale;
                        tile_max = tile_max.max(*slot);
                    }

                    let new_max = running_max.max(tile_max);
                    let correction = (running_max - new_max).exp();
                    running_sum *= correction;
                    acc.iter_mut().for_each(|a| *a *= correction);

                    for (score, j) in tile.iter().zip(start..stop) {
                        let p = (score - new_max).exp();
                        running_sum += p;
                        let weight = p * params.keep_scale(geo, b, h, i, j);
                        if weight != 0.0 {
                            let v_row = &v[geo.row(b, j, h)..][..d];
                            for (a, x) in acc.iter_mut().zip(v_row) {
                                *a += weight * x;
                            }
                        }
                    }
                    running_max = new_max;
                }

                if running_sum > 0.0 {
                    let out_row = &mut out[geo.row(b, i, h)..][..d];
                    for (o, a) in out_row.iter_mut().zip(&acc) {
                        *o = a / running_sum;
                    }
                }
            }
        }
    }
    out
}

/// Fill `probs[..end]` with the softmax row of query `(b, h, i)` and return `end`.
fn row_probabilities(
    geo: &Geometry,
    params: &KernelParams,
    q: &[f32],
    k: &[f32],
    (b, h, i): (usize, usize, usize),
    probs: &mut [f32],
) -> usize {
    let d = geo.head_dim;
    let scale = geo.scale();
    let end = params.key_end(i, geo.seq_len);
    let q_row = &q[geo.row(b, i, h)..][..d];

    let mut max = f32::NEG_INFINITY;
    for (j, p) in probs.iter_mut().enumerate().take(end) {
        *p = dot(q_row, &k[geo.row(b, j, h)..][..d]) * scale;
        max = max.max(*p);
    }
    let mut sum = 0f32;
    for p in probs.iter_mut().take(end) {
        *p = (*p - max).exp();
        sum += *p;
    }
    for p in probs.iter_mut().take(end) {
        *p /= sum;
    }
    end
}

/// Softmax weights before dropout, `[batch, heads, seq_len, seq_len]`.
/// Masked positions are exactly zero.
pub(crate) fn probabilities(geo: &Geometry, params: &KernelParams, q: &[f32], k: &[f32]) -> Vec<f32> {
    let s = geo.seq_len;
    let mut matrix = vec![0f32; geo.batch * geo.heads * s * s];
    for b in 0..geo.batch {
        for h in 0..geo.heads {
            for i in 0..s {
                let offset = ((b * geo.heads + h) * s + i) * s;
                row_probabilities(geo, params, q, k, (b, h, i), &mut matrix[offset..offset + s]);
            }
        }
    }
    matrix
}

pub(crate) struct Gradients {
    pub dq: Vec<f32>,
    pub dk: Vec<f32>,
    pub dv: Vec<f32>,
}

/// Gradients of `forward` given the upstream gradient `grad_out`.
///
/// `out` must be the forward output for the same inputs and parameters; its
/// row-wise dot with `grad_out` is the softmax Jacobian correction term.
pub(crate) fn backward(
    geo: &Geometry,
    params: &KernelParams,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    out: &[f32],
    grad_out: &[f32],
) -> Gradients {
    let d = geo.head_dim;
    let scale = geo.scale();
    let mut dq = vec![0f32; geo.len()];
    let mut dk = vec![0f32; geo.len()];
    let mut dv = vec![0f32; geo.len()];
    let mut probs = vec![0f32; geo.seq_len];

    for b in 0..geo.batch {
        for h in 0..geo.heads {
            for i in 0..geo.seq_len {
                let end = row_probabilities(geo, params, q, k, (b, h, i), &mut probs);
                let row_i = geo.row(b, i, h);
                let grad_row = &grad_out[row_i..][..d];
                let delta = dot(grad_row, &out[row_i..][..d]);

                for (j, &p) in probs.iter().enumerate().take(end) {
                    let row_j = geo.row(b, j, h);
                    let keep = params.keep_scale(geo, b, h, i, j);
                    if keep != 0.0 {
                        for (g, x) in dv[row_j..][..d].iter_mut().zip(grad_row) {
                            *g += p * keep * x;
                        }
                    }
                    let dp = keep * dot(grad_row, &v[row_j..][..d]);
                    let ds = p * (dp - delta) * scale;
                    if ds == 0.0 {
                        continue;
                    }
                    for x in 0..d {
                        dq[row_i + x] += ds * k[row_j + x];
                        dk[row_j + x] += ds * q[row_i + x];
                    }
                }
            }
        }
    }

    Gradients { dq, dk, dv }
}
