//! Fine attention over the raw keys/values of the selected blocks.

use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use tracing::trace;

use super::{batched_matmul, mask_scores};
use super::selection::Selection;
use crate::utils::error::{NsaError, Result};

/// Gather whole blocks of `x` per query row.
///
/// `x` is (batch, heads, seq, dim) with `seq` a multiple of `block_size`;
/// `indices` is (batch, heads, queries, k) block ids. Returns
/// (batch, heads, queries, k * block_size, dim) with the k blocks laid end to
/// end. The gather goes through `index_select`, so gradients flow back into `x`.
pub fn gather_blocks(x: &Tensor, block_size: usize, indices: &Tensor) -> Result<Tensor> {
    let (batch, heads, seq_len, dim) = x.dims4()?;
    if block_size == 0 || seq_len % block_size != 0 {
        return Err(NsaError::shape(format!(
            "sequence length {} is not a multiple of block size {}",
            seq_len, block_size
        )));
    }
    let num_blocks = seq_len / block_size;

    let (ib, ih, queries, k) = indices.dims4()?;
    if (ib, ih) != (batch, heads) {
        return Err(NsaError::shape(format!(
            "indices lead with ({}, {}) but keys/values have ({}, {})",
            ib, ih, batch, heads
        )));
    }

    // one row per (batch, head, block)
    let arena = x
        .contiguous()?
        .reshape((batch * heads * num_blocks, block_size * dim))?;

    let ids = indices.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
    let per_head = queries * k;
    let rows = ids
        .iter()
        .enumerate()
        .map(|(slot, &block)| {
            let block = block as usize;
            if block >= num_blocks {
                return Err(NsaError::shape(format!(
                    "block index {} out of range for {} blocks",
                    block, num_blocks
                )));
            }
            Ok(((slot / per_head) * num_blocks + block) as u32)
        })
        .collect::<Result<Vec<u32>>>()?;
    let rows = Tensor::from_vec(rows, ids.len(), x.device())?;

    Ok(arena
        .index_select(&rows, 0)?
        .reshape((batch, heads, queries, k * block_size, dim))?)
}

pub struct FineAttention {
    block_size: usize,
    scale: f64,
}

impl FineAttention {
    pub fn new(dim_head: usize, block_size: usize) -> Self {
        Self {
            block_size,
            scale: (dim_head as f64).powf(-0.5),
        }
    }

    /// Attend each query to the raw positions of its selected blocks.
    ///
    /// Masking is per block: a valid block lies entirely in the query's past,
    /// so no token-level causal mask is needed inside it. Rows without any
    /// valid slot produce zeros.
    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, selection: &Selection) -> Result<Tensor> {
        let (batch, heads, seq_len, _) = q.dims4()?;
        let num_selected = selection.num_selected();
        let candidates = num_selected * self.block_size;

        let padded_len = seq_len.div_ceil(self.block_size) * self.block_size;
        let remainder = padded_len - seq_len;
        let (k, v) = if remainder > 0 {
            (k.pad_with_zeros(2, 0, remainder)?, v.pad_with_zeros(2, 0, remainder)?)
        } else {
            (k.clone(), v.clone())
        };

        // (b, h, i, sel * n, d)
        let fk = gather_blocks(&k, self.block_size, &selection.indices)?;
        let fv = gather_blocks(&v, self.block_size, &selection.indices)?;

        // (b, h, i, 1, d) @ (b, h, i, d, sel * n) -> (b, h, i, sel * n)
        let sim = batched_matmul(&q.unsqueeze(3)?, &fk.transpose(3, 4)?)?.squeeze(3)?;
        let sim = (sim * self.scale)?;

        let visible = selection
            .valid
            .unsqueeze(4)?
            .broadcast_as((batch, heads, seq_len, num_selected, self.block_size))?
            .reshape((batch, heads, seq_len, candidates))?;
        let sim = mask_scores(&sim, &visible)?;

        let attn = ops::softmax(&sim, D::Minus1)?;
        let out = batched_matmul(&attn.unsqueeze(3)?, &fv)?.squeeze(3)?;

        // zero the rows whose softmax ran over masked slots only
        let any_valid = selection.valid.max_keepdim(3)?.to_dtype(out.dtype())?;
        trace!(candidates, "fine attention");
        Ok(out.broadcast_mul(&any_valid)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_gather_blocks_picks_rows() -> Result<()> {
        let device = Device::Cpu;
        // positions 0..8 with value = position, block size 2
        let x = Tensor::arange(0f32, 8f32, &device)?.reshape((1, 1, 8, 1))?;
        let indices = Tensor::from_vec(vec![3u32, 0, 1, 1], (1, 1, 2, 2), &device)?;

        let gathered = gather_blocks(&x, 2, &indices)?;
        assert_eq!(gathered.dims(), &[1, 1, 2, 4, 1]);
        let values = gathered.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values, vec![6.0, 7.0, 0.0, 1.0, 2.0, 3.0, 2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_gather_rejects_out_of_range() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::zeros((1, 1, 4, 2), DType::F32, &device)?;
        let indices = Tensor::from_vec(vec![2u32], (1, 1, 1, 1), &device)?;
        assert!(matches!(gather_blocks(&x, 2, &indices), Err(NsaError::Shape(_))));
        Ok(())
    }

    #[test]
    fn test_no_valid_block_gives_zero() -> Result<()> {
        let device = Device::Cpu;
        let fine = FineAttention::new(4, 2);
        let q = Tensor::randn(0f32, 1f32, (1, 1, 5, 4), &device)?;
        let k = Tensor::randn(0f32, 1f32, (1, 1, 5, 4), &device)?;
        let v = Tensor::randn(0f32, 1f32, (1, 1, 5, 4), &device)?;

        let selection = Selection::empty(1, 1, 5, 2, &device)?;
        let out = fine.forward(&q, &k, &v, &selection)?;
        assert_eq!(out.dims(), &[1, 1, 5, 4]);
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|x| *x == 0.0));
        Ok(())
    }

    #[test]
    fn test_batch_rows_are_independent() -> Result<()> {
        let device = Device::Cpu;
        let fine = FineAttention::new(4, 2);
        let (b, h, n, k) = (2, 2, 7, 2);
        let q = Tensor::randn(0f32, 1f32, (b, h, n, 4), &device)?;
        let kk = Tensor::randn(0f32, 1f32, (b, h, n, 4), &device)?;
        let v = Tensor::randn(0f32, 1f32, (b, h, n, 4), &device)?;

        let slots = b * h * n * k;
        let ids: Vec<u32> = (0..slots as u32).map(|s| (s * 5 + 1) % 4).collect();
        let valid: Vec<u8> = (0..slots as u8).map(|s| (s % 3 != 0) as u8).collect();
        let selection = Selection {
            indices: Tensor::from_vec(ids, (b, h, n, k), &device)?,
            valid: Tensor::from_vec(valid, (b, h, n, k), &device)?,
        };
        let batched = fine.forward(&q, &kk, &v, &selection)?;
        assert_eq!(batched.dims(), &[b, h, n, 4]);

        for row in 0..b {
            let pick = |t: &Tensor| t.narrow(0, row, 1)?.contiguous();
            let single = fine.forward(
                &pick(&q)?,
                &pick(&kk)?,
                &pick(&v)?,
                &Selection {
                    indices: pick(&selection.indices)?,
                    valid: pick(&selection.valid)?,
                },
            )?;
            let diff = (single - batched.narrow(0, row, 1)?)?
                .abs()?
                .max_all()?
                .to_scalar::<f32>()?;
            assert!(diff < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_invalid_slot_is_ignored() -> Result<()> {
        let device = Device::Cpu;
        let fine = FineAttention::new(4, 2);
        let q = Tensor::randn(0f32, 1f32, (1, 1, 4, 4), &device)?;
        let k = Tensor::randn(0f32, 1f32, (1, 1, 4, 4), &device)?;
        let v = Tensor::randn(0f32, 1f32, (1, 1, 4, 4), &device)?;

        // slot 1 points at block 1 but is invalid: same as selecting block 0 alone
        let both = Selection {
            indices: Tensor::from_vec(vec![0u32, 1].repeat(4), (1, 1, 4, 2), &device)?,
            valid: Tensor::from_vec(vec![1u8, 0].repeat(4), (1, 1, 4, 2), &device)?,
        };
        let single = Selection {
            indices: Tensor::zeros((1, 1, 4, 1), DType::U32, &device)?,
            valid: Tensor::ones((1, 1, 4, 1), DType::U8, &device)?,
        };

        let a = fine.forward(&q, &k, &v, &both)?;
        let b = fine.forward(&q, &k, &v, &single)?;
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
