pub mod attention_benchmark;
