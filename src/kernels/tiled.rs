//! Tiled evaluator: online softmax over key tiles with a hand-written backward.
//!
//! Each query row walks its causal diagonal tile and then every valid
//! selected block, folding each tile into a [`SoftmaxState`]. The backward
//! pass recomputes the row log-sum-exp and accumulates
//! `dS = P * (dP - rowsum(dO * O))` tile by tile, so neither direction holds
//! a full score row.

use std::ops::Range;
use std::time::Instant;

use candle_core::{bail, CpuStorage, CustomOp3, DType, Layout, Shape, Tensor};
use rayon::prelude::*;

use super::online_softmax::SoftmaxState;
use super::{AttendShape, SparseAttend};
use crate::utils::error::Result;
use crate::utils::metrics;

#[derive(Clone, Copy, Debug, Default)]
pub struct TiledAttend;

impl SparseAttend for TiledAttend {
    fn name(&self) -> &'static str {
        "tiled"
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
        let op = SelectedBlockAttention {
            shape,
            scale: shape.scale(),
            indices: shape.host_indices(indices)?,
            valid: shape.host_mask(mask)?,
        };

        let dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?.contiguous()?;
        let k = k.to_dtype(DType::F32)?.contiguous()?;
        let v = v.to_dtype(DType::F32)?.contiguous()?;

        let out = q.apply_op3(&k, &v, op)?.to_dtype(dtype)?;
        metrics::record_attend(self.name(), start.elapsed().as_secs_f64());
        Ok(out)
    }
}

/// Custom op carrying the host-side block selection for one call.
struct SelectedBlockAttention {
    shape: AttendShape,
    scale: f32,
    /// (batch, kv_heads, seq, num_selected), row-major.
    indices: Vec<u32>,
    valid: Vec<u8>,
}

impl SelectedBlockAttention {
    /// Key ranges attended by query `i` under kv head `kv` of batch `b`:
    /// the diagonal tile first, then each valid selected block in slot order.
    fn tiles(&self, b: usize, kv: usize, i: usize) -> impl Iterator<Item = Range<usize>> + '_ {
        let bs = self.shape.block_size;
        let sel = self.shape.num_selected;
        let base = ((b * self.shape.kv_heads + kv) * self.shape.seq_len + i) * sel;

        let diagonal = (i / bs) * bs..i + 1;
        let selected = (base..base + sel)
            .filter(move |&slot| self.valid[slot] != 0)
            .map(move |slot| {
                let block = self.indices[slot] as usize;
                block * bs..(block + 1) * bs
            });
        std::iter::once(diagonal).chain(selected)
    }

    /// Scaled scores of `q_row` against the key rows in `keys`.
    fn scores(&self, q_row: &[f32], k: &[f32], keys: Range<usize>, out: &mut Vec<f32>) {
        let d = self.shape.dim;
        out.clear();
        out.extend(keys.map(|j| self.scale * dot(q_row, &k[j * d..(j + 1) * d])));
    }

    /// Online softmax over every tile of one row. `k` and `v` are the
    /// (seq, dim) slices of the row's kv head.
    fn row_state(&self, q_row: &[f32], k: &[f32], v: &[f32], b: usize, kv: usize, i: usize) -> SoftmaxState {
        let d = self.shape.dim;
        let mut state = SoftmaxState::empty(d);
        let mut scores = Vec::with_capacity(self.shape.block_size);
        for keys in self.tiles(b, kv, i) {
            self.scores(q_row, k, keys.clone(), &mut scores);
            state.absorb(&scores, &v[keys.start * d..keys.end * d]);
        }
        state
    }

    fn kv_offset(&self, b: usize, kv: usize) -> usize {
        (b * self.shape.kv_heads + kv) * self.shape.seq_len * self.shape.dim
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    for (y, &x) in y.iter_mut().zip(x) {
        *y += alpha * x;
    }
}

fn contiguous_f32<'a>(storage: &'a CpuStorage, layout: &Layout, what: &str) -> candle_core::Result<&'a [f32]> {
    let data = storage.as_slice::<f32>()?;
    match layout.contiguous_offsets() {
        Some((start, end)) => Ok(&data[start..end]),
        None => bail!("selected-block-attention: {what} must be contiguous"),
    }
}

impl CustomOp3 for SelectedBlockAttention {
    fn name(&self) -> &'static str {
        "selected-block-attention"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
        s3: &CpuStorage,
        l3: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let q = contiguous_f32(s1, l1, "q")?;
        let k = contiguous_f32(s2, l2, "k")?;
        let v = contiguous_f32(s3, l3, "v")?;

        let AttendShape {
            q_heads, seq_len: n, dim: d, ..
        } = self.shape;
        let g = self.shape.groups();
        let kv_len = n * d;

        let mut out = vec![0f32; q.len()];
        out.par_chunks_mut(d).enumerate().for_each(|(row, out_row)| {
            let b = row / (q_heads * n);
            let qh = (row / n) % q_heads;
            let i = row % n;
            let kv = qh / g;
            let offset = self.kv_offset(b, kv);

            let state = self.row_state(
                &q[row * d..(row + 1) * d],
                &k[offset..offset + kv_len],
                &v[offset..offset + kv_len],
                b,
                kv,
                i,
            );
            out_row.copy_from_slice(&state.finish());
        });

        Ok((CpuStorage::F32(out), l1.shape().clone()))
    }

    fn bwd(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        out: &Tensor,
        grad_out: &Tensor,
    ) -> candle_core::Result<(Option<Tensor>, Option<Tensor>, Option<Tensor>)> {
        let qs = q.flatten_all()?.to_vec1::<f32>()?;
        let ks = k.flatten_all()?.to_vec1::<f32>()?;
        let vs = v.flatten_all()?.to_vec1::<f32>()?;
        let os = out.flatten_all()?.to_vec1::<f32>()?;
        let dos = grad_out.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;

        let AttendShape {
            kv_heads, seq_len: n, dim: d, ..
        } = self.shape;
        let g = self.shape.groups();
        let kv_len = n * d;

        let mut dq = vec![0f32; qs.len()];
        let mut dk = vec![0f32; ks.len()];
        let mut dv = vec![0f32; vs.len()];

        // One unit per (batch, kv head): it owns the dk/dv of that head and
        // the dq of the query heads grouped onto it.
        dq.par_chunks_mut(g * kv_len)
            .zip(dk.par_chunks_mut(kv_len))
            .zip(dv.par_chunks_mut(kv_len))
            .enumerate()
            .for_each(|(unit, ((dq_u, dk_u), dv_u))| {
                let b = unit / kv_heads;
                let kv = unit % kv_heads;
                let offset = self.kv_offset(b, kv);
                let k_h = &ks[offset..offset + kv_len];
                let v_h = &vs[offset..offset + kv_len];
                let q_base = unit * g * kv_len;

                let mut scores = Vec::with_capacity(self.shape.block_size);
                for local in 0..g * n {
                    let i = local % n;
                    let row = q_base + local * d;
                    let q_row = &qs[row..row + d];
                    let do_row = &dos[row..row + d];

                    let lse = self.row_state(q_row, k_h, v_h, b, kv, i).logsumexp();
                    let delta = dot(do_row, &os[row..row + d]);
                    let dq_row = &mut dq_u[local * d..(local + 1) * d];

                    for keys in self.tiles(b, kv, i) {
                        self.scores(q_row, k_h, keys.clone(), &mut scores);
                        for (j, &s) in keys.zip(scores.iter()) {
                            let p = (s - lse).exp();
                            let key = j * d..(j + 1) * d;

                            axpy(p, do_row, &mut dv_u[key.clone()]);
                            let ds = p * (dot(do_row, &v_h[key.clone()]) - delta) * self.scale;
                            axpy(ds, &k_h[key.clone()], dq_row);
                            axpy(ds, q_row, &mut dk_u[key]);
                        }
                    }
                }
            });

        let dq = Tensor::from_vec(dq, q.shape(), q.device())?;
        let dk = Tensor::from_vec(dk, k.shape(), k.device())?;
        let dv = Tensor::from_vec(dv, v.shape(), v.device())?;
        Ok((Some(dq), Some(dk), Some(dv)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::MaterializedAttend;
    use crate::utils::error::NsaError;
    use candle_core::{Device, Var};

    struct Case {
        q: Var,
        k: Var,
        v: Var,
        indices: Tensor,
        mask: Tensor,
        block_size: usize,
    }

    /// Deterministic pseudo-random selections with a mix of valid and
    /// invalid slots and repeated blocks.
    fn case(q_heads: usize, kv_heads: usize, n: usize, d: usize, bs: usize, sel: usize) -> Result<Case> {
        let device = Device::Cpu;
        let slots = kv_heads * n * sel;
        let num_blocks = (n / bs) as u32;
        let mut state = 0x2545_f491u32;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };
        let ids: Vec<u32> = (0..slots).map(|_| next() % num_blocks).collect();
        let valid: Vec<u8> = (0..slots).map(|_| (next() % 3 != 0) as u8).collect();

        Ok(Case {
            q: Var::from_tensor(&Tensor::randn(0f32, 1f32, (1, q_heads, n, d), &device)?)?,
            k: Var::from_tensor(&Tensor::randn(0f32, 1f32, (1, kv_heads, n, d), &device)?)?,
            v: Var::from_tensor(&Tensor::randn(0f32, 1f32, (1, kv_heads, n, d), &device)?)?,
            indices: Tensor::from_vec(ids, (1, kv_heads, n, sel), &device)?,
            mask: Tensor::from_vec(valid, (1, kv_heads, n, sel), &device)?,
            block_size: bs,
        })
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
    }

    fn run(evaluator: &dyn SparseAttend, c: &Case, grad_out: &Tensor) -> Result<(Tensor, [Tensor; 3])> {
        let out = evaluator.attend(&c.q, &c.k, &c.v, c.block_size, &c.indices, &c.mask)?;
        let loss = (&out * grad_out)?.sum_all()?;
        let grads = loss.backward()?;
        let grad = |t: &Var| {
            grads
                .get(t)
                .cloned()
                .ok_or_else(|| NsaError::shape("missing gradient"))
        };
        Ok((out, [grad(&c.q)?, grad(&c.k)?, grad(&c.v)?]))
    }

    #[test]
    fn test_matches_materialized_forward_and_backward() -> Result<()> {
        let c = case(4, 2, 16, 8, 4, 3)?;
        let grad_out = Tensor::randn(0f32, 1f32, (1, 4, 16, 8), &Device::Cpu)?;

        let (out, grads) = run(&TiledAttend, &c, &grad_out)?;
        let (expected, expected_grads) = run(&MaterializedAttend, &c, &grad_out)?;

        assert!(max_abs_diff(&out, &expected)? < 1e-4);
        for (g, e) in grads.iter().zip(expected_grads.iter()) {
            assert!(max_abs_diff(g, e)? < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn test_no_selected_slots() -> Result<()> {
        let c = case(2, 2, 8, 4, 4, 0)?;
        let out = TiledAttend.attend(&c.q, &c.k, &c.v, 4, &c.indices, &c.mask)?;
        let expected = MaterializedAttend.attend(&c.q, &c.k, &c.v, 4, &c.indices, &c.mask)?;
        assert!(max_abs_diff(&out, &expected)? < 1e-5);

        // the first query of each block only sees itself
        let first = out.narrow(2, 4, 1)?;
        let v_first = c.v.narrow(2, 4, 1)?;
        assert!(max_abs_diff(&first, &v_first)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_rejects_partial_block() -> Result<()> {
        let c = case(2, 2, 8, 4, 4, 1)?;
        let q = c.q.narrow(2, 0, 6)?;
        let k = c.k.narrow(2, 0, 6)?;
        let v = c.v.narrow(2, 0, 6)?;
        let indices = c.indices.narrow(2, 0, 6)?;
        let mask = c.mask.narrow(2, 0, 6)?;
        assert!(matches!(
            TiledAttend.attend(&q, &k, &v, 4, &indices, &mask),
            Err(NsaError::Shape(_))
        ));
        Ok(())
    }
}
