//! Top-k block selection from coarse importance scores.

use candle_core::{DType, Device, Tensor};

use super::MASK_VALUE;
use crate::utils::error::{NsaError, Result};

/// Blocks chosen for fine attention, one row per (batch, head, query).
#[derive(Clone, Debug)]
pub struct Selection {
    /// (batch, heads, seq, k) u32 block indices
    pub indices: Tensor,
    /// (batch, heads, seq, k) u8, 1 where the slot names a causally visible block
    pub valid: Tensor,
}

impl Selection {
    /// A selection with every slot invalid, used when no full block exists yet.
    pub fn empty(batch: usize, heads: usize, seq_len: usize, k: usize, device: &Device) -> Result<Self> {
        let shape = (batch, heads, seq_len, k);
        Ok(Self {
            indices: Tensor::zeros(shape, DType::U32, device)?,
            valid: Tensor::zeros(shape, DType::U8, device)?,
        })
    }

    pub fn num_selected(&self) -> usize {
        self.indices.dims().last().copied().unwrap_or(0)
    }

    /// Share of slots that are valid, in [0, 1].
    pub fn valid_fraction(&self) -> Result<f64> {
        let fraction = self.valid.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()?;
        Ok(fraction as f64)
    }
}

/// Pick the `k` highest-scoring blocks per row of `importance`
/// (batch, heads, seq, num_blocks).
///
/// Masked blocks carry [`MASK_VALUE`] and can still be ranked into the top k
/// when fewer than k blocks are visible; those slots come back flagged invalid.
/// When `k` exceeds the number of blocks the extra slots point at block 0 and
/// are invalid. Ordering among equal scores is unspecified.
pub fn select_blocks(importance: &Tensor, k: usize) -> Result<Selection> {
    let (batch, heads, seq_len, num_blocks) = importance.dims4()?;
    if k == 0 {
        return Err(NsaError::Config("cannot select zero blocks".to_string()));
    }

    let importance = importance.contiguous()?;
    let take = k.min(num_blocks);

    let order = importance.arg_sort_last_dim(false)?;
    let indices = order.narrow(3, 0, take)?.contiguous()?;
    let values = importance.gather(&indices, 3)?;
    let valid = values.gt(MASK_VALUE)?;

    if take == k {
        return Ok(Selection { indices, valid });
    }

    let pad = Selection::empty(batch, heads, seq_len, k - take, importance.device())?;
    Ok(Selection {
        indices: Tensor::cat(&[&indices, &pad.indices], 3)?,
        valid: Tensor::cat(&[&valid, &pad.valid], 3)?,
    })
}
