//! Prometheus metrics for the attention layer.
//!
//! Forward call counts and latency, evaluator dispatch, and how much of the
//! selection budget was usable on the last call.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global metrics registry
static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

pub struct MetricsRegistry {
    pub registry: Registry,

    // Module forward passes
    pub forward_calls: Counter,
    pub forward_duration: Histogram,

    // Block attention evaluators, labelled "materialized" / "tiled"
    pub attend_calls: CounterVec,
    pub attend_duration: HistogramVec,

    /// Fraction of selection slots that named a causally valid block
    pub selection_valid_fraction: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let forward_calls = Counter::with_opts(Opts::new(
            "nsa_forward_calls_total",
            "Sparse attention forward passes",
        ))
        .expect("valid metric definition");
        registry
            .register(Box::new(forward_calls.clone()))
            .expect("metric registered once");

        let forward_duration = Histogram::with_opts(
            HistogramOpts::new("nsa_forward_seconds", "Sparse attention forward latency")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .expect("valid metric definition");
        registry
            .register(Box::new(forward_duration.clone()))
            .expect("metric registered once");

        let attend_calls = CounterVec::new(
            Opts::new("nsa_attend_calls_total", "Selected-block attention calls per evaluator"),
            &["evaluator"],
        )
        .expect("valid metric definition");
        registry
            .register(Box::new(attend_calls.clone()))
            .expect("metric registered once");

        let attend_duration = HistogramVec::new(
            HistogramOpts::new("nsa_attend_seconds", "Selected-block attention latency")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["evaluator"],
        )
        .expect("valid metric definition");
        registry
            .register(Box::new(attend_duration.clone()))
            .expect("metric registered once");

        let selection_valid_fraction = Gauge::with_opts(Opts::new(
            "nsa_selection_valid_fraction",
            "Fraction of valid selection slots in the last forward pass",
        ))
        .expect("valid metric definition");
        registry
            .register(Box::new(selection_valid_fraction.clone()))
            .expect("metric registered once");

        Self {
            registry,
            forward_calls,
            forward_duration,
            attend_calls,
            attend_duration,
            selection_valid_fraction,
        }
    }

    /// Gather all metrics as Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global metrics registry.
pub fn get_metrics() -> &'static MetricsRegistry {
    REGISTRY.get_or_init(MetricsRegistry::new)
}

/// Record one module forward pass.
pub fn record_forward(duration_secs: f64, valid_fraction: f64) {
    let m = get_metrics();
    m.forward_calls.inc();
    m.forward_duration.observe(duration_secs);
    m.selection_valid_fraction.set(valid_fraction);
}

/// Record one evaluator call.
pub fn record_attend(evaluator: &str, duration_secs: f64) {
    let m = get_metrics();
    m.attend_calls.with_label_values(&[evaluator]).inc();
    m.attend_duration
        .with_label_values(&[evaluator])
        .observe(duration_secs);
}
