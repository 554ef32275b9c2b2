use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use native_sparse_attention::benchmarks::attention_benchmark;
use native_sparse_attention::kernels::select_attend;
use native_sparse_attention::utils::{logging, metrics};
use native_sparse_attention::{NsaConfig, Result, SparseAttention};
use tracing::{info, warn};

fn main() -> Result<()> {
    logging::init_logging_from_env();
    info!("Starting native sparse attention demo");

    let device = if candle_core::utils::cuda_is_available() {
        info!("Using CUDA GPU");
        Device::new_cuda(0)?
    } else if candle_core::utils::metal_is_available() {
        info!("Using Metal GPU");
        Device::new_metal(0)?
    } else {
        info!("Using CPU");
        Device::Cpu
    };

    let config = match std::env::var("NSA_CONFIG") {
        Ok(path) => NsaConfig::from_file_with_env(path)?,
        Err(_) => NsaConfig::from_env(),
    };
    println!("{:#?}", config);

    println!("\n--- Sparse attention layer ---");
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let layer = SparseAttention::new(config.clone(), vb)?;

    let (batch_size, seq_len) = (2, 31);
    let input = Tensor::randn(0f32, 1f32, (batch_size, seq_len, config.dim), &device)?;
    let branches = layer.forward_with_branches(&input)?;

    println!("Input shape: {:?}", input.shape());
    println!("Output shape: {:?}", branches.out.shape());
    println!("Gates shape: {:?}", branches.gates.shape());
    println!(
        "Selected slots per query: {}, valid fraction: {:.3}",
        branches.selection.num_selected(),
        branches.selection.valid_fraction()?
    );

    println!("\n--- Materialized vs tiled block attention ---");
    let evaluator = select_attend(&device);
    println!("Evaluator for this device: {}", evaluator.name());

    // the tiled kernel only has a CPU implementation
    let report = attention_benchmark::check_equivalence(&Device::Cpu)?;
    println!(
        "max |diff|: forward {:.2e}, dQ {:.2e}, dK {:.2e}, dV {:.2e}",
        report.forward, report.grad_q, report.grad_k, report.grad_v
    );
    if report.within(1e-2) {
        println!("Evaluators agree within 1e-2");
    } else {
        warn!(max_diff = report.max(), "evaluators disagree");
    }

    if std::env::args().any(|arg| arg == "--bench") {
        attention_benchmark::run_benchmark(&device)?;
    }

    println!("\n--- Metrics ---");
    println!("{}", metrics::get_metrics().gather());

    Ok(())
}
