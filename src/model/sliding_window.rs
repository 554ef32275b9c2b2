//! Exact causal sliding-window attention.
//!
//! Key `j` is visible to query `i` iff `j <= i` and `i - j <= window_size`.
//! Queries are processed in chunks, each against only the keys its window can
//! reach, so cost grows with `seq_len * (chunk + window_size)`.

use candle_core::{Tensor, D};
use candle_nn::ops;

use super::{mask_from_fn, mask_scores};
use crate::utils::error::Result;

/// Queries handled per chunk when the window is smaller than this.
const MIN_QUERY_CHUNK: usize = 64;

pub struct SlidingWindowAttention {
    window_size: usize,
    scale: f64,
}

impl SlidingWindowAttention {
    pub fn new(dim_head: usize, window_size: usize) -> Self {
        Self {
            window_size,
            scale: (dim_head as f64).powf(-0.5),
        }
    }

    /// q, k, v: (batch, heads, seq, dim_head) -> (batch, heads, seq, dim_head)
    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let (_, _, seq_len, _) = q.dims4()?;
        let chunk = self.window_size.max(MIN_QUERY_CHUNK);
        let window = self.window_size;

        let mut outputs = Vec::with_capacity(seq_len.div_ceil(chunk));
        for q_start in (0..seq_len).step_by(chunk) {
            let q_len = chunk.min(seq_len - q_start);
            let k_start = q_start.saturating_sub(window);
            let k_len = q_start + q_len - k_start;

            let q_chunk = q.narrow(2, q_start, q_len)?.contiguous()?;
            let k_chunk = k.narrow(2, k_start, k_len)?.contiguous()?;
            let v_chunk = v.narrow(2, k_start, k_len)?.contiguous()?;

            let sim = (q_chunk.matmul(&k_chunk.transpose(2, 3)?.contiguous()?)? * self.scale)?;
            let visible = mask_from_fn(q_len, k_len, q.device(), |i, j| {
                let (qp, kp) = (q_start + i, k_start + j);
                kp <= qp && qp - kp <= window
            })?;
            let sim = mask_scores(&sim, &visible)?;

            let attn = ops::softmax(&sim, D::Minus1)?;
            outputs.push(attn.matmul(&v_chunk)?);
        }

        Ok(Tensor::cat(&outputs, 2)?)
    }
}
