//! Native sparse attention layer.
//!
//! Three branches are evaluated per head and mixed by learned gates:
//! - coarse attention over compressed blocks plus learned memory slots
//! - fine attention over the raw tokens of the top-k blocks ranked by the
//!   coarse logits
//! - exact causal sliding-window attention
//!
//! Pipeline: norm -> qkv projection -> compression -> coarse attention and
//! importance -> selection -> fine attention -> local attention -> gated
//! combine -> head merge -> output projection.

use std::time::Instant;

use candle_core::{Tensor, D};
use candle_nn::{Init, LayerNorm, Linear, Module, VarBuilder};
use tracing::{debug, trace};

use super::coarse::CoarseAttention;
use super::combine::{combine, StrategyCombine};
use super::compress::Compressor;
use super::fine::FineAttention;
use super::selection::{select_blocks, Selection};
use super::sliding_window::SlidingWindowAttention;
use super::{merge_heads, split_heads};
use crate::utils::config::NsaConfig;
use crate::utils::error::Result;
use crate::utils::metrics;

const RMS_NORM_EPS: f64 = 1e-6;

/// Everything a forward pass produces, for inspection and tests.
pub struct SparseAttentionOutput {
    /// (batch, seq, dim)
    pub out: Tensor,
    /// Per-branch outputs, (batch, heads, seq, dim_head)
    pub compressed: Tensor,
    pub fine: Tensor,
    pub local: Tensor,
    /// (batch, heads, seq, 3)
    pub gates: Tensor,
    pub selection: Selection,
}

pub struct SparseAttention {
    config: NsaConfig,
    norm: Option<LayerNorm>,
    to_qkv: Linear,
    k_compress: Compressor,
    v_compress: Compressor,
    coarse: CoarseAttention,
    fine: FineAttention,
    sliding_window: SlidingWindowAttention,
    strategy_combine: StrategyCombine,
    combine_heads: Linear,
}

impl SparseAttention {
    /// Build the layer; the configuration is validated first.
    pub fn new(config: NsaConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let dim_inner = config.dim_inner();
        let norm = if config.norm {
            // the fused RmsNorm kernel has no backward; LayerNorm's rms path does
            let weight = vb.pp("norm").get_with_hints(config.dim, "weight", Init::Const(1.0))?;
            Some(LayerNorm::rms_norm(weight, RMS_NORM_EPS))
        } else {
            None
        };

        let to_qkv = candle_nn::linear_no_bias(config.dim, 3 * dim_inner, vb.pp("to_qkv"))?;

        let k_compress = Compressor::new(
            config.heads,
            config.dim_head,
            config.compress_block_size,
            vb.pp("k_compress"),
        )?;
        let v_compress = Compressor::new(
            config.heads,
            config.dim_head,
            config.compress_block_size,
            vb.pp("v_compress"),
        )?;
        let coarse = CoarseAttention::new(
            config.heads,
            config.dim_head,
            config.num_compressed_mem_kv,
            config.compress_block_size,
            vb.pp("compress_mem_kv"),
        )?;
        let fine = FineAttention::new(config.dim_head, config.selection_block_size);
        let sliding_window = SlidingWindowAttention::new(config.dim_head, config.sliding_window_size);

        let strategy_combine = StrategyCombine::new(config.dim, config.heads, vb.pp("strategy_combine"))?;
        let combine_heads = candle_nn::linear_no_bias(dim_inner, config.dim, vb.pp("combine_heads"))?;

        Ok(Self {
            config,
            norm,
            to_qkv,
            k_compress,
            v_compress,
            coarse,
            fine,
            sliding_window,
            strategy_combine,
            combine_heads,
        })
    }

    pub fn config(&self) -> &NsaConfig {
        &self.config
    }

    /// (batch, seq, dim) -> (batch, seq, dim)
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_branches(x)?.out)
    }

    /// Forward pass that also returns the branch outputs, gates and selection.
    pub fn forward_with_branches(&self, x: &Tensor) -> Result<SparseAttentionOutput> {
        let start = Instant::now();
        let (batch, seq_len, _) = x.dims3()?;
        let heads = self.config.heads;

        let x = match &self.norm {
            Some(norm) => norm.forward(x)?,
            None => x.clone(),
        };

        // (b, n, 3 * h * d) -> 3 x (b, h, n, d)
        let qkv = self.to_qkv.forward(&x)?.chunk(3, D::Minus1)?;
        let q = split_heads(&qkv[0], heads)?;
        let k = split_heads(&qkv[1], heads)?;
        let v = split_heads(&qkv[2], heads)?;

        // 1. coarse attention over memory + compressed blocks
        let num_blocks = self.k_compress.num_blocks(seq_len);
        debug!(batch, seq_len, num_blocks, "sparse attention forward");

        let compressed = if num_blocks > 0 {
            Some((self.k_compress.forward(&k)?, self.v_compress.forward(&v)?))
        } else {
            None
        };
        let coarse = self
            .coarse
            .forward(&q, compressed.as_ref().map(|(ck, cv)| (ck, cv)))?;

        // 2. fine attention over the blocks the coarse logits rank highest
        let selection = match &coarse.importance {
            Some(importance) => select_blocks(importance, self.config.num_selected_blocks)?,
            None => Selection::empty(
                batch,
                heads,
                seq_len,
                self.config.num_selected_blocks,
                q.device(),
            )?,
        };
        let fine = self.fine.forward(&q, &k, &v, &selection)?;

        // 3. local sliding window
        let local = self.sliding_window.forward(&q, &k, &v)?;

        // gated combine, merge heads, project
        let gates = self.strategy_combine.gates(&x)?;
        let mixed = combine(&gates, [&coarse.out, &fine, &local])?;
        let out = self.combine_heads.forward(&merge_heads(&mixed)?)?;

        let valid_fraction = selection.valid_fraction()?;
        trace!(valid_fraction, "selection coverage");
        metrics::record_forward(start.elapsed().as_secs_f64(), valid_fraction);

        Ok(SparseAttentionOutput {
            out,
            compressed: coarse.out,
            fine,
            local,
            gates,
            selection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::NsaError;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    fn small_config() -> NsaConfig {
        NsaConfig {
            dim: 32,
            dim_head: 8,
            heads: 2,
            sliding_window_size: 2,
            compress_block_size: 4,
            selection_block_size: 4,
            num_selected_blocks: 2,
            num_compressed_mem_kv: 2,
            norm: true,
        }
    }

    #[test]
    fn test_sparse_attention_forward() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = SparseAttention::new(small_config(), vb)?;

        for seq_len in [3, 16, 31] {
            let x = Tensor::randn(0f32, 1f32, (2, seq_len, 32), &device)?;
            let out = attn.forward(&x)?;
            assert_eq!(out.dims(), &[2, seq_len, 32]);
        }
        Ok(())
    }

    #[test]
    fn test_branch_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = SparseAttention::new(small_config(), vb)?;

        let x = Tensor::randn(0f32, 1f32, (1, 10, 32), &device)?;
        let output = attn.forward_with_branches(&x)?;
        assert_eq!(output.compressed.dims(), &[1, 2, 10, 8]);
        assert_eq!(output.fine.dims(), &[1, 2, 10, 8]);
        assert_eq!(output.local.dims(), &[1, 2, 10, 8]);
        assert_eq!(output.gates.dims(), &[1, 2, 10, 3]);
        assert_eq!(output.selection.indices.dims(), &[1, 2, 10, 2]);
        Ok(())
    }

    #[test]
    fn test_gradients_reach_input_and_every_parameter() -> Result<()> {
        let device = Device::Cpu;
        for norm in [true, false] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let attn = SparseAttention::new(NsaConfig { norm, ..small_config() }, vb)?;

            let x = Var::randn(0f32, 1f32, (2, 19, 32), &device)?;
            let weights = Tensor::randn(0f32, 1f32, (2, 19, 32), &device)?;
            let loss = (attn.forward(&x)? * weights)?.sum_all()?;
            let grads = loss.backward()?;

            let mut tracked: Vec<(String, Tensor)> = varmap
                .data()
                .lock()
                .unwrap()
                .iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect();
            tracked.push(("input".to_string(), x.as_tensor().clone()));
            assert_eq!(tracked.len(), if norm { 14 } else { 13 });

            for (name, tensor) in &tracked {
                let grad = grads
                    .get(tensor)
                    .unwrap_or_else(|| panic!("no gradient for {} (norm = {})", name, norm));
                let max = grad.abs()?.max_all()?.to_scalar::<f32>()?;
                assert!(max.is_finite(), "non-finite gradient for {}", name);
            }
        }
        Ok(())
    }

    #[test]
    fn test_rejects_mismatched_block_sizes() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let config = NsaConfig {
            selection_block_size: 8,
            ..small_config()
        };
        assert!(matches!(SparseAttention::new(config, vb), Err(NsaError::Config(_))));
    }

    #[test]
    fn test_rejects_missing_memory() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let config = NsaConfig {
            num_compressed_mem_kv: 0,
            ..small_config()
        };
        assert!(matches!(SparseAttention::new(config, vb), Err(NsaError::Config(_))));
    }
}
