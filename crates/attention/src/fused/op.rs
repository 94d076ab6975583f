//! Candle custom op wiring the tiled kernels into the autodiff graph.

use candle_core::{bail, CpuStorage, CustomOp3, DType, Layout, Result, Shape, Tensor};

use super::kernel::{self, Geometry, KernelParams};

pub(crate) struct FlashAttnOp {
    params: KernelParams,
}

impl FlashAttnOp {
    pub fn new(params: KernelParams) -> Self {
        Self { params }
    }
}

fn geometry(dims: &[usize]) -> Result<Geometry> {
    match Geometry::from_dims(dims) {
        Some(geo) => Ok(geo),
        None => bail!("flash attention expects [batch, seq_len, heads, head_dim], got {dims:?}"),
    }
}

fn contiguous_f32<'a>(storage: &'a CpuStorage, layout: &Layout, name: &str) -> Result<&'a [f32]> {
    let data = match storage {
        CpuStorage::F32(data) => data.as_slice(),
        _ => bail!("{name}: tiled flash attention expects f32 storage"),
    };
    match layout.contiguous_offsets() {
        Some((start, end)) => Ok(&data[start..end]),
        None => bail!("{name} must be contiguous"),
    }
}

fn flat_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()
}

impl CustomOp3 for FlashAttnOp {
    fn name(&self) -> &'static str {
        "tiled-flash-attn"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
        s3: &CpuStorage,
        l3: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let geo = geometry(l1.dims())?;
        if l2.dims() != l1.dims() || l3.dims() != l1.dims() {
            bail!(
                "q, k, v shapes differ: {:?} {:?} {:?}",
                l1.dims(),
                l2.dims(),
                l3.dims()
            );
        }
        let q = contiguous_f32(s1, l1, "q")?;
        let k = contiguous_f32(s2, l2, "k")?;
        let v = contiguous_f32(s3, l3, "v")?;

        let out = kernel::forward(&geo, &self.params, q, k, v);
        Ok((CpuStorage::F32(out), l1.shape().clone()))
    }

    fn bwd(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        res: &Tensor,
        grad_res: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>, Option<Tensor>)> {
        let geo = geometry(q.dims())?;
        let grads = kernel::backward(
            &geo,
            &self.params,
            &flat_f32(q)?,
            &flat_f32(k)?,
            &flat_f32(v)?,
            &flat_f32(res)?,
            &flat_f32(grad_res)?,
        );
        let device = q.device();
        let dq = Tensor::from_vec(grads.dq, q.dims(), device)?;
        let dk = Tensor::from_vec(grads.dk, k.dims(), device)?;
        let dv = Tensor::from_vec(grads.dv, v.dims(), device)?;
        Ok((Some(dq), Some(dk), Some(dv)))
    }
}
