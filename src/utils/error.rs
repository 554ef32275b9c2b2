use thiserror::Error;

#[derive(Error, Debug)]
pub enum NsaError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape error: {0}")]
    Shape(String),
}

impl NsaError {
    pub fn block_size_mismatch(compress: usize, selection: usize) -> Self {
        Self::Config(format!(
            "selection_block_size ({}) must equal compress_block_size ({})",
            selection, compress
        ))
    }

    pub fn no_memory_kv() -> Self {
        Self::Config("num_compressed_mem_kv must be greater than 0".to_string())
    }

    pub fn heads_not_divisible(query_heads: usize, kv_heads: usize) -> Self {
        Self::Config(format!(
            "query heads ({}) must be divisible by kv heads ({})",
            query_heads, kv_heads
        ))
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, NsaError>;
