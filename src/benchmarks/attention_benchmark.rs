use std::time::{Duration, Instant};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::info;

use crate::kernels::{MaterializedAttend, SparseAttend, TiledAttend};
use crate::model::sparse_attention::SparseAttention;
use crate::utils::config::NsaConfig;
use crate::utils::error::{NsaError, Result};

#[derive(Clone, Copy, Debug)]
pub struct BenchConfig {
    pub batch_size: usize,
    pub q_heads: usize,
    pub kv_heads: usize,
    pub dim: usize,
    pub block_size: usize,
    pub num_selected: usize,
    pub warmup_iters: u32,
    pub measure_iters: u32,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            q_heads: 4,
            kv_heads: 2,
            dim: 64,
            block_size: 16,
            num_selected: 4,
            warmup_iters: 2,
            measure_iters: 5,
        }
    }
}

fn time_iters<F>(cfg: &BenchConfig, mut step: F) -> Result<Duration>
where
    F: FnMut() -> Result<()>,
{
    for _ in 0..cfg.warmup_iters {
        step()?;
    }
    let start = Instant::now();
    for _ in 0..cfg.measure_iters {
        step()?;
    }
    Ok(start.elapsed() / cfg.measure_iters.max(1))
}

/// Forward and forward+backward time of one evaluator at one sequence length.
pub fn bench_evaluator(
    evaluator: &dyn SparseAttend,
    cfg: &BenchConfig,
    seq_len: usize,
    device: &Device,
) -> Result<(Duration, Duration)> {
    let q = Var::randn(0f32, 1f32, (cfg.batch_size, cfg.q_heads, seq_len, cfg.dim), device)?;
    let k = Var::randn(0f32, 1f32, (cfg.batch_size, cfg.kv_heads, seq_len, cfg.dim), device)?;
    let v = Var::randn(0f32, 1f32, (cfg.batch_size, cfg.kv_heads, seq_len, cfg.dim), device)?;

    // every query selects the blocks just behind its own, clamped to block 0
    let num_blocks = seq_len / cfg.block_size;
    let ids: Vec<u32> = (0..cfg.batch_size * cfg.kv_heads * seq_len)
        .flat_map(|row| {
            let block = (row % seq_len) / cfg.block_size;
            (1..=cfg.num_selected).map(move |back| block.saturating_sub(back).min(num_blocks - 1) as u32)
        })
        .collect();
    let sel_shape = (cfg.batch_size, cfg.kv_heads, seq_len, cfg.num_selected);
    let indices = Tensor::from_vec(ids, sel_shape, device)?;
    let mask = Tensor::ones(sel_shape, DType::U8, device)?;

    let forward = time_iters(cfg, || {
        evaluator.attend(&q, &k, &v, cfg.block_size, &indices, &mask)?;
        Ok(())
    })?;
    let backward = time_iters(cfg, || {
        let out = evaluator.attend(&q, &k, &v, cfg.block_size, &indices, &mask)?;
        out.sum_all()?.backward()?;
        Ok(())
    })?;
    Ok((forward, backward))
}

/// Largest absolute differences between two evaluators on one input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EquivalenceReport {
    pub forward: f32,
    pub grad_q: f32,
    pub grad_k: f32,
    pub grad_v: f32,
}

impl EquivalenceReport {
    pub fn max(&self) -> f32 {
        self.forward.max(self.grad_q).max(self.grad_k).max(self.grad_v)
    }

    pub fn within(&self, atol: f32) -> bool {
        self.max() <= atol
    }
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}

/// Compare two evaluators on the same inputs: forward output, and gradients
/// of `sum(output)` with respect to q, k and v.
pub fn compare_evaluators(
    a: &dyn SparseAttend,
    b: &dyn SparseAttend,
    q: &Var,
    k: &Var,
    v: &Var,
    block_size: usize,
    indices: &Tensor,
    mask: &Tensor,
) -> Result<EquivalenceReport> {
    let run = |evaluator: &dyn SparseAttend| -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let out = evaluator.attend(q, k, v, block_size, indices, mask)?;
        let grads = out.sum_all()?.backward()?;
        let grad = |var: &Var| {
            grads
                .get(var)
                .cloned()
                .ok_or_else(|| NsaError::shape(format!("{} produced no gradient", evaluator.name())))
        };
        Ok((out, grad(q)?, grad(k)?, grad(v)?))
    };

    let (out_a, dq_a, dk_a, dv_a) = run(a)?;
    let (out_b, dq_b, dk_b, dv_b) = run(b)?;
    Ok(EquivalenceReport {
        forward: max_abs_diff(&out_a, &out_b)?,
        grad_q: max_abs_diff(&dq_a, &dq_b)?,
        grad_k: max_abs_diff(&dk_a, &dk_b)?,
        grad_v: max_abs_diff(&dv_a, &dv_b)?,
    })
}

/// Materialized vs tiled on batch 1, 4 query heads over 2 kv heads,
/// 512 tokens in blocks of 16, dim 64, one selected slot fixed to block 0
/// and valid everywhere.
pub fn check_equivalence(device: &Device) -> Result<EquivalenceReport> {
    let (batch, q_heads, kv_heads, seq_len, dim, block_size) = (1, 4, 2, 512, 64, 16);

    let q = Var::randn(0f32, 1f32, (batch, q_heads, seq_len, dim), device)?;
    let k = Var::randn(0f32, 1f32, (batch, kv_heads, seq_len, dim), device)?;
    let v = Var::randn(0f32, 1f32, (batch, kv_heads, seq_len, dim), device)?;
    let indices = Tensor::zeros((batch, kv_heads, seq_len, 1), DType::U32, device)?;
    let mask = Tensor::ones((batch, kv_heads, seq_len, 1), DType::U8, device)?;

    let report = compare_evaluators(
        &MaterializedAttend,
        &TiledAttend,
        &q,
        &k,
        &v,
        block_size,
        &indices,
        &mask,
    )?;
    info!(
        forward = report.forward,
        grad_q = report.grad_q,
        grad_k = report.grad_k,
        grad_v = report.grad_v,
        "materialized vs tiled"
    );
    Ok(report)
}

pub fn run_benchmark(device: &Device) -> Result<()> {
    println!("\n=== Selected Block Attention Benchmark ===");
    let cfg = BenchConfig::default();
    println!(
        "Config: batch={}, q_heads={}, kv_heads={}, dim={}, block={}, selected={}, warmup={}, measure={} iterations",
        cfg.batch_size,
        cfg.q_heads,
        cfg.kv_heads,
        cfg.dim,
        cfg.block_size,
        cfg.num_selected,
        cfg.warmup_iters,
        cfg.measure_iters
    );

    let evaluators: [&dyn SparseAttend; 2] = [&MaterializedAttend, &TiledAttend];
    for seq_len in [128, 256, 512] {
        println!("\nseq_len={}", seq_len);
        for evaluator in evaluators {
            if !device.is_cpu() && evaluator.name() == "tiled" {
                continue;
            }
            let (forward, backward) = bench_evaluator(evaluator, &cfg, seq_len, device)?;
            println!(
                "  {:<13} forward {:>10.2?}  forward+backward {:>10.2?}",
                evaluator.name(),
                forward,
                backward
            );
        }
    }

    println!("\n=== Sparse Attention Layer ===");
    let config = NsaConfig::default();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let layer = SparseAttention::new(config.clone(), vb)?;
    for seq_len in [64, 256] {
        let x = Tensor::randn(0f32, 1f32, (cfg.batch_size, seq_len, config.dim), device)?;
        let avg = time_iters(&cfg, || {
            layer.forward(&x)?;
            Ok(())
        })?;
        println!("  seq_len={:<5} {:.2?} per forward pass", seq_len, avg);
    }

    Ok(())
}
