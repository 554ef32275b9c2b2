//! The three attention branches, their gating, and the layer that wires them.
//!
//! Axis order everywhere is (batch, head, position, feature) unless a function
//! documents otherwise.

pub mod coarse;
pub mod combine;
pub mod compress;
pub mod fine;
pub mod selection;
pub mod sliding_window;
pub mod sparse_attention;

use candle_core::{Device, Tensor};

use crate::utils::error::{NsaError, Result};

/// Finite sentinel written into masked logits before softmax.
///
/// Kept finite (rather than `-inf`) so that importance scores can be compared
/// against it to recover which selection slots were masked.
pub const MASK_VALUE: f32 = -f32::MAX;

/// Replace every entry of `scores` where `visible` is zero with [`MASK_VALUE`].
///
/// `visible` is a u8 tensor broadcastable to `scores`.
pub fn mask_scores(scores: &Tensor, visible: &Tensor) -> Result<Tensor> {
    let fill = Tensor::new(MASK_VALUE, scores.device())?.broadcast_as(scores.shape())?;
    let visible = visible.broadcast_as(scores.shape())?;
    Ok(visible.where_cond(scores, &fill)?)
}

/// Split (batch, seq, heads * dim_head) into (batch, heads, seq, dim_head).
pub fn split_heads(x: &Tensor, heads: usize) -> Result<Tensor> {
    let (batch, seq_len, inner) = x.dims3()?;
    Ok(x.reshape((batch, seq_len, heads, inner / heads))?
        .transpose(1, 2)?
        .contiguous()?)
}

/// Merge (batch, heads, seq, dim_head) back into (batch, seq, heads * dim_head).
pub fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (batch, heads, seq_len, dim_head) = x.dims4()?;
    Ok(x.transpose(1, 2)?.reshape((batch, seq_len, heads * dim_head))?)
}

/// Matrix product over any number of matching leading axes.
///
/// CPU matmul accepts at most two batch axes, so the leading axes are folded
/// into one: (..., m, k) @ (..., k, n) -> (..., m, n).
pub fn batched_matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (a_dims, b_dims) = (a.dims(), b.dims());
    let rank = a_dims.len();
    if rank < 2 || b_dims.len() != rank || a_dims[..rank - 2] != b_dims[..rank - 2] {
        return Err(NsaError::shape(format!(
            "cannot multiply {:?} by {:?}",
            a_dims, b_dims
        )));
    }
    let (m, k, n) = (a_dims[rank - 2], a_dims[rank - 1], b_dims[rank - 1]);
    if b_dims[rank - 2] != k {
        return Err(NsaError::shape(format!(
            "inner dimensions differ: {:?} by {:?}",
            a_dims, b_dims
        )));
    }
    let lead = &a_dims[..rank - 2];
    let batch: usize = lead.iter().product();

    let a = a.reshape((batch, m, k))?.contiguous()?;
    let b = b.reshape((batch, k, n))?.contiguous()?;
    let mut out_dims = lead.to_vec();
    out_dims.extend([m, n]);
    Ok(a.matmul(&b)?.reshape(out_dims)?)
}

/// Row-major u8 mask of shape (rows, cols) from a predicate.
pub(crate) fn mask_from_fn(
    rows: usize,
    cols: usize,
    device: &Device,
    visible: impl Fn(usize, usize) -> bool,
) -> Result<Tensor> {
    let mask: Vec<u8> = (0..rows)
        .flat_map(|i| (0..cols).map(move |j| (i, j)))
        .map(|(i, j)| u8::from(visible(i, j)))
        .collect();
    Ok(Tensor::from_vec(mask, (rows, cols), device)?)
}
