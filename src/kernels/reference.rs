//! Materialized evaluator: explicit gather and a full masked softmax per row.
//!
//! Quadratic in the candidate count but built only from differentiable tensor
//! ops, so autograd provides the backward pass. This is the numerical
//! reference the tiled kernel is held to.

use std::time::Instant;

use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use super::{AttendShape, SparseAttend};
use crate::model::fine::gather_blocks;
use crate::model::{batched_matmul, mask_from_fn, mask_scores};
use crate::utils::error::Result;
use crate::utils::metrics;

#[derive(Clone, Copy, Debug, Default)]
pub struct MaterializedAttend;

impl SparseAttend for MaterializedAttend {
    fn name(&self) -> &'static str {
        "materialized"
    }

    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        block_size: usize,
        indices: &Tensor,
        mask: &Tensor,
    ) -> Result<Tensor> {
        let start = Instant::now();
        let shape = AttendShape::check(q, k, v, block_size, indices, mask)?;
        // range check before gathering
        shape.host_indices(indices)?;

        let out = materialized_attend(&shape, q, k, v, indices, mask)?;
        metrics::record_attend(self.name(), start.elapsed().as_secs_f64());
        Ok(out)
    }
}

fn materialized_attend(
    shape: &AttendShape,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    indices: &Tensor,
    mask: &Tensor,
) -> Result<Tensor> {
    let AttendShape {
        batch: b,
        kv_heads: h,
        seq_len: n,
        dim: d,
        block_size: bs,
        num_blocks: w,
        num_selected: sel,
        ..
    } = *shape;
    let g = shape.groups();

    let q = (q * shape.scale() as f64)?;

    // causal diagonal block
    // q: (b, h*g, n, d) -> (b, h, g, w, bs, d) -> (b, h, w, g * bs, d)
    let qb = q
        .reshape(vec![b, h, g, w, bs, d])?
        .permute(vec![0, 1, 3, 2, 4, 5])?
        .contiguous()?
        .reshape((b, h, w, g * bs, d))?;
    // (b, h, w, d, bs)
    let kt = k.reshape((b, h, w, bs, d))?.transpose(3, 4)?;
    // (b, h, w, g * bs, bs)
    let diag_sim = batched_matmul(&qb, &kt)?;
    let causal = mask_from_fn(g * bs, bs, q.device(), |row, j| j <= row % bs)?;
    let diag_sim = mask_scores(&diag_sim, &causal)?;
    // -> (b, h, w, bs_i, g, bs_j) -> (b, h, n, g, bs)
    let diag_sim = diag_sim
        .reshape(vec![b, h, w, g, bs, bs])?
        .permute(vec![0, 1, 2, 4, 3, 5])?
        .contiguous()?
        .reshape((b, h, n, g, bs))?;

    // values of the diagonal block, repeated for each query in it: (b, h, n, bs, d)
    let diag_v = v
        .reshape(vec![b, h, w, 1, bs, d])?
        .broadcast_as(vec![b, h, w, bs, bs, d])?
        .contiguous()?
        .reshape((b, h, n, bs, d))?;

    if sel == 0 {
        let attn = ops::softmax(&diag_sim, D::Minus1)?;
        return regroup(&batched_matmul(&attn, &diag_v)?, shape);
    }

    // selected blocks: (b, h, n, sel * bs, d)
    let sel_k = gather_blocks(k, bs, indices)?;
    let sel_v = gather_blocks(v, bs, indices)?;

    // q per position: (b, h, n, g, d) @ (b, h, n, d, sel * bs) -> (b, h, n, g, sel * bs)
    let qn = q
        .reshape((b, h, g, n, d))?
        .permute((0, 1, 3, 2, 4))?
        .contiguous()?;
    let sel_sim = batched_matmul(&qn, &sel_k.transpose(3, 4)?)?;

    let visible = mask
        .ne(0u8)?
        .to_dtype(DType::U8)?
        .reshape(vec![b, h, n, 1, sel, 1])?
        .broadcast_as(vec![b, h, n, 1, sel, bs])?
        .reshape((b, h, n, 1, sel * bs))?;
    let sel_sim = mask_scores(&sel_sim, &visible)?;

    // one softmax over diagonal + selected candidates
    let sim = Tensor::cat(&[&diag_sim, &sel_sim], 4)?;
    let attn = ops::softmax(&sim, D::Minus1)?;

    let values = Tensor::cat(&[&diag_v, &sel_v], 3)?;
    regroup(&batched_matmul(&attn, &values)?, shape)
}

/// (b, h, n, g, d) -> (b, h * g, n, d)
fn regroup(out: &Tensor, shape: &AttendShape) -> Result<Tensor> {
    Ok(out
        .permute((0, 1, 3, 2, 4))?
        .contiguous()?
        .reshape((shape.batch, shape.q_heads, shape.seq_len, shape.dim))?)
}
