//! Block compression of keys or values.
//!
//! Each run of `block_size` positions is pooled into one summary vector by a
//! per-head affine map over the flattened block. Weights are shared across
//! blocks and batch. A learned intra-block position bias is added first so the
//! pooling can tell offsets within a block apart. Trailing positions that do
//! not fill a block are dropped.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use crate::utils::error::{NsaError, Result};

pub struct Compressor {
    block_size: usize,
    /// (heads, block_size, dim_head)
    intrablock_positions: Tensor,
    /// (heads, block_size * dim_head, dim_head)
    weight: Tensor,
    /// (heads, dim_head)
    bias: Tensor,
}

impl Compressor {
    pub fn new(heads: usize, dim_head: usize, block_size: usize, vb: VarBuilder) -> Result<Self> {
        let fan_in = block_size * dim_head;
        let bound = 1.0 / (fan_in as f64).sqrt();
        let uniform = Init::Uniform { lo: -bound, up: bound };

        let intrablock_positions = vb.get_with_hints(
            (heads, block_size, dim_head),
            "intrablock_positions",
            Init::Const(0.0),
        )?;
        let weight = vb.get_with_hints((heads, fan_in, dim_head), "weight", uniform)?;
        let bias = vb.get_with_hints((heads, dim_head), "bias", uniform)?;

        Ok(Self {
            block_size,
            intrablock_positions,
            weight,
            bias,
        })
    }

    /// Number of full blocks in a sequence of `seq_len` positions.
    pub fn num_blocks(&self, seq_len: usize) -> usize {
        seq_len / self.block_size
    }

    /// (batch, heads, seq, dim_head) -> (batch, heads, seq / block_size, dim_head)
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq_len, dim_head) = x.dims4()?;
        let num_blocks = self.num_blocks(seq_len);
        if num_blocks == 0 {
            return Err(NsaError::shape(format!(
                "sequence length {} is shorter than one compress block ({})",
                seq_len, self.block_size
            )));
        }

        // (b, h, w, n, d) + (1, h, 1, n, d)
        let blocks = x
            .narrow(2, 0, num_blocks * self.block_size)?
            .contiguous()?
            .reshape((batch, heads, num_blocks, self.block_size, dim_head))?
            .broadcast_add(&self.intrablock_positions.unsqueeze(0)?.unsqueeze(2)?)?;

        // (b, h, w, n * d) @ (1, h, n * d, d) -> (b, h, w, d)
        let flat = blocks.reshape((batch, heads, num_blocks, self.block_size * dim_head))?;
        let pooled = flat.broadcast_matmul(&self.weight.unsqueeze(0)?)?;
        let bias = self.bias.unsqueeze(0)?.unsqueeze(2)?;
        Ok(pooled.broadcast_add(&bias)?)
    }
}
