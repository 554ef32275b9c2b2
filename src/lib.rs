//! Native sparse attention on candle.
//!
//! [`SparseAttention`] combines three attention branches per head (compressed
//! blocks, selected fine blocks and a sliding window) through learned gates.
//! The [`kernels`] module provides two interchangeable evaluators for
//! attention over selected blocks plus the causal diagonal, one of them a
//! tiled kernel with its own backward pass.

pub mod benchmarks;
pub mod kernels;
pub mod model;
pub mod utils;

pub use kernels::{select_attend, SparseAttend};
pub use model::sparse_attention::{SparseAttention, SparseAttentionOutput};
pub use utils::config::NsaConfig;
pub use utils::error::{NsaError, Result};
