//! Learned per-token, per-head gating of the three branch outputs.
//!
//! Gates are independent sigmoids, not a softmax: the three weights for one
//! (head, position) need not sum to one.

use candle_core::Tensor;
use candle_nn::{ops, Linear, Module, VarBuilder};

use crate::utils::error::{NsaError, Result};

/// Branch order along the strategy axis of the gates.
pub const NUM_STRATEGIES: usize = 3;

pub struct StrategyCombine {
    heads: usize,
    to_gates: Linear,
}

impl StrategyCombine {
    pub fn new(dim: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        let to_gates = candle_nn::linear(dim, NUM_STRATEGIES * heads, vb.pp("to_gates"))?;
        Ok(Self { heads, to_gates })
    }

    /// (batch, seq, dim) -> (batch, heads, seq, 3), each entry in [0, 1].
    ///
    /// Strategy index 0 = compressed, 1 = fine, 2 = sliding window.
    pub fn gates(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        let logits = self.to_gates.forward(x)?;
        Ok(ops::sigmoid(&logits)?
            .reshape((batch, seq_len, self.heads, NUM_STRATEGIES))?
            .permute((0, 2, 1, 3))?
            .contiguous()?)
    }
}

/// Weight each branch by its gate (broadcast over features) and sum.
///
/// `gates` is (batch, heads, seq, 3); every branch is (batch, heads, seq, dim_head).
pub fn combine(gates: &Tensor, branches: [&Tensor; NUM_STRATEGIES]) -> Result<Tensor> {
    let (batch, heads, seq_len, strategies) = gates.dims4()?;
    if strategies != NUM_STRATEGIES {
        return Err(NsaError::shape(format!(
            "expected {} gate values per position, got {}",
            NUM_STRATEGIES, strategies
        )));
    }

    let mut out: Option<Tensor> = None;
    for (s, branch) in branches.iter().enumerate() {
        let (bb, bh, bn, _) = branch.dims4()?;
        if (bb, bh, bn) != (batch, heads, seq_len) {
            return Err(NsaError::shape(format!(
                "branch {} is {:?} but gates are {:?}",
                s,
                branch.dims(),
                gates.dims()
            )));
        }
        let weighted = branch.broadcast_mul(&gates.narrow(3, s, 1)?)?;
        out = Some(match out {
            Some(acc) => (acc + weighted)?,
            None => weighted,
        });
    }
    out.ok_or_else(|| NsaError::shape("no branches to combine"))
}
