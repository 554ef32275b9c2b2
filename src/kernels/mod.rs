//! Evaluators for attention over selected blocks plus the causal diagonal.
//!
//! Every query attends to (a) the keys of its own block up to and including
//! itself and (b) the keys of each valid selected block. Query heads are
//! grouped over key/value heads: query head `qh` reads kv head `qh / groups`.
//!
//! Two evaluators implement the same function:
//! - [`MaterializedAttend`] gathers the candidate keys and runs an explicit
//!   masked softmax with ordinary differentiable tensor ops.
//! - [`TiledAttend`] streams tiles through an online softmax and supplies its
//!   own backward pass; it never materializes a score row.

pub mod online_softmax;
pub mod reference;
pub mod tiled;

use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::utils::error::{NsaError, Result};

pub use reference::MaterializedAttend;
pub use tiled::TiledAttend;

/// Capability interface shared by both evaluators.
pub trait SparseAttend: Send + Sync {
    fn name(&self) -> &'static str;

    /// q: (batch, q_heads, seq, dim); k, v: (batch, kv_heads, seq, dim);
    /// indices: (batch, kv_heads, seq, num_selected) block ids;
    /// mask: same shape, nonzero where the slot is valid.
    /// Returns (batch, q_heads, seq, dim), differentiable in q, k and v.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        block_size: usize,
        indices: &Tensor,
        mask: &Tensor,
    ) -> Result<Tensor>;
}

/// Pick the evaluator for a device: the tiled kernel where it has an
/// implementation (CPU), the materialized one elsewhere.
pub fn select_attend(device: &Device) -> Box<dyn SparseAttend> {
    let evaluator: Box<dyn SparseAttend> = if device.is_cpu() {
        Box::new(TiledAttend)
    } else {
        Box::new(MaterializedAttend)
    };
    info!(evaluator = evaluator.name(), "selected block attention evaluator");
    evaluator
}

/// Validated dimensions of one evaluator call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttendShape {
    pub batch: usize,
    pub q_heads: usize,
    pub kv_heads: usize,
    pub seq_len: usize,
    pub dim: usize,
    pub block_size: usize,
    pub num_blocks: usize,
    pub num_selected: usize,
}

impl AttendShape {
    pub fn check(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        block_size: usize,
        indices: &Tensor,
        mask: &Tensor,
    ) -> Result<Self> {
        let (batch, q_heads, seq_len, dim) = q.dims4()?;
        let (kb, kv_heads, kn, kd) = k.dims4()?;

        if (kb, kn, kd) != (batch, seq_len, dim) {
            return Err(NsaError::shape(format!(
                "keys {:?} do not match queries {:?}",
                k.dims(),
                q.dims()
            )));
        }
        if v.dims() != k.dims() {
            return Err(NsaError::shape(format!(
                "values {:?} do not match keys {:?}",
                v.dims(),
                k.dims()
            )));
        }
        if kv_heads == 0 || q_heads % kv_heads != 0 {
            return Err(NsaError::heads_not_divisible(q_heads, kv_heads));
        }
        if seq_len == 0 {
            return Err(NsaError::shape("empty sequence"));
        }
        if block_size == 0 || seq_len % block_size != 0 {
            return Err(NsaError::shape(format!(
                "sequence length {} is not a multiple of block size {}",
                seq_len, block_size
            )));
        }

        let (ib, ih, in_, num_selected) = indices.dims4()?;
        if (ib, ih, in_) != (batch, kv_heads, seq_len) {
            return Err(NsaError::shape(format!(
                "indices {:?} must be (batch, kv_heads, seq, selected) = ({}, {}, {}, _)",
                indices.dims(),
                batch,
                kv_heads,
                seq_len
            )));
        }
        if mask.dims() != indices.dims() {
            return Err(NsaError::shape(format!(
                "mask {:?} does not match indices {:?}",
                mask.dims(),
                indices.dims()
            )));
        }

        Ok(Self {
            batch,
            q_heads,
            kv_heads,
            seq_len,
            dim,
            block_size,
            num_blocks: seq_len / block_size,
            num_selected,
        })
    }

    /// Query heads per kv head.
    pub fn groups(&self) -> usize {
        self.q_heads / self.kv_heads
    }

    pub fn scale(&self) -> f32 {
        (self.dim as f32).powf(-0.5)
    }

    /// Host copy of the indices, range-checked against the block count.
    pub fn host_indices(&self, indices: &Tensor) -> Result<Vec<u32>> {
        let ids = indices.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
        if let Some(bad) = ids.iter().find(|&&b| b as usize >= self.num_blocks) {
            return Err(NsaError::shape(format!(
                "block index {} out of range for {} blocks",
                bad, self.num_blocks
            )));
        }
        Ok(ids)
    }

    /// Host copy of the validity mask as 0/1 bytes.
    pub fn host_mask(&self, mask: &Tensor) -> Result<Vec<u8>> {
        let mask = mask.ne(0u8)?;
        Ok(mask.flatten_all()?.to_vec1::<u8>()?)
    }
}
