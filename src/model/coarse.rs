//! Coarse attention over learned memory slots plus compressed blocks.
//!
//! The masked pre-softmax logits against the compressed blocks double as the
//! importance scores used for block selection.

use candle_core::{Device, Tensor, D};
use candle_nn::{ops, Init, VarBuilder};
use tracing::debug;

use super::{mask_from_fn, mask_scores};
use crate::utils::error::Result;

/// Output of the coarse branch.
pub struct CoarseOutput {
    /// (batch, heads, seq, dim_head)
    pub out: Tensor,
    /// Masked logits against compressed blocks only, (batch, heads, seq, num_blocks).
    /// `None` when the sequence holds no full block.
    pub importance: Option<Tensor>,
}

/// Visibility of memory slots and compressed blocks to each query, shape
/// (seq_len, num_mem + num_blocks), 1 = visible.
///
/// Memory slots are always visible. Block `c` is visible to query `i` iff its
/// closing position `(c + 1) * block_size - 1` is strictly before `i`.
pub fn compressed_causal_mask(
    seq_len: usize,
    num_mem: usize,
    num_blocks: usize,
    block_size: usize,
    device: &Device,
) -> Result<Tensor> {
    mask_from_fn(seq_len, num_mem + num_blocks, device, |i, j| {
        j < num_mem || (j - num_mem + 1) * block_size - 1 < i
    })
}

pub struct CoarseAttention {
    /// (heads, num_mem, dim_head)
    mem_k: Tensor,
    mem_v: Tensor,
    block_size: usize,
    scale: f64,
}

impl CoarseAttention {
    pub fn new(
        heads: usize,
        dim_head: usize,
        num_mem: usize,
        block_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let init = Init::Randn { mean: 0.0, stdev: 0.02 };
        let mem_k = vb.get_with_hints((heads, num_mem, dim_head), "mem_k", init)?;
        let mem_v = vb.get_with_hints((heads, num_mem, dim_head), "mem_v", init)?;

        Ok(Self {
            mem_k,
            mem_v,
            block_size,
            scale: (dim_head as f64).powf(-0.5),
        })
    }

    pub fn num_mem(&self) -> usize {
        self.mem_k.dims()[1]
    }

    /// Attend raw queries to memory + compressed keys.
    ///
    /// `compressed` holds the compressed (k, v), each (batch, heads, num_blocks, dim_head).
    pub fn forward(&self, q: &Tensor, compressed: Option<(&Tensor, &Tensor)>) -> Result<CoarseOutput> {
        let (batch, heads, seq_len, dim_head) = q.dims4()?;
        let num_mem = self.num_mem();

        let mem_shape = (batch, heads, num_mem, dim_head);
        // materialized per batch row; a stride-0 batch axis would survive the cat
        let mem_k = self.mem_k.unsqueeze(0)?.broadcast_as(mem_shape)?.contiguous()?;
        let mem_v = self.mem_v.unsqueeze(0)?.broadcast_as(mem_shape)?.contiguous()?;

        let (ck, cv, num_blocks) = match compressed {
            Some((ck, cv)) => (
                Tensor::cat(&[&mem_k, ck], 2)?,
                Tensor::cat(&[&mem_v, cv], 2)?,
                ck.dim(2)?,
            ),
            None => (mem_k, mem_v, 0),
        };
        debug!(seq_len, num_mem, num_blocks, "coarse attention");

        // (b, h, i, d) @ (b, h, d, j) -> (b, h, i, j)
        let sim = (q.matmul(&ck.transpose(2, 3)?.contiguous()?)? * self.scale)?;

        let visible =
            compressed_causal_mask(seq_len, num_mem, num_blocks, self.block_size, q.device())?;
        let sim = mask_scores(&sim, &visible)?;

        let attn = ops::softmax(&sim, D::Minus1)?;
        let out = attn.matmul(&cv)?;

        let importance = if num_blocks > 0 {
            Some(sim.narrow(3, num_mem, num_blocks)?)
        } else {
            None
        };

        Ok(CoarseOutput { out, importance })
    }
}
