//! Configuration for the sparse attention layer, with JSON file support and
//! environment variable overrides.
//!
//! Pattern: `NSA_*` environment variables override file values.
//! Example: `NSA_HEADS=16` overrides `heads`.

use crate::utils::error::{NsaError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Hyperparameters of one sparse attention layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NsaConfig {
    /// Model dimension of the input and output
    #[serde(default = "default_dim")]
    pub dim: usize,

    /// Feature dimension of each head
    #[serde(default = "default_dim_head")]
    pub dim_head: usize,

    /// Number of attention heads
    #[serde(default = "default_heads")]
    pub heads: usize,

    /// Look-back of the local branch, in positions
    #[serde(default = "default_sliding_window_size")]
    pub sliding_window_size: usize,

    /// Positions pooled into one compressed key/value
    #[serde(default = "default_block_size")]
    pub compress_block_size: usize,

    /// Raw block granularity for fine attention; must equal `compress_block_size`
    #[serde(default = "default_block_size")]
    pub selection_block_size: usize,

    /// Blocks each query selects for fine attention
    #[serde(default = "default_num_selected_blocks")]
    pub num_selected_blocks: usize,

    /// Learned memory key/values always visible to coarse attention
    #[serde(default = "default_num_compressed_mem_kv")]
    pub num_compressed_mem_kv: usize,

    /// RMS-normalize the input before projecting
    #[serde(default = "default_norm")]
    pub norm: bool,
}

fn default_dim() -> usize { 512 }
fn default_dim_head() -> usize { 64 }
fn default_heads() -> usize { 8 }
fn default_sliding_window_size() -> usize { 2 }
fn default_block_size() -> usize { 4 }
fn default_num_selected_blocks() -> usize { 2 }
fn default_num_compressed_mem_kv() -> usize { 4 }
fn default_norm() -> bool { true }

impl Default for NsaConfig {
    fn default() -> Self {
        Self {
            dim: default_dim(),
            dim_head: default_dim_head(),
            heads: default_heads(),
            sliding_window_size: default_sliding_window_size(),
            compress_block_size: default_block_size(),
            selection_block_size: default_block_size(),
            num_selected_blocks: default_num_selected_blocks(),
            num_compressed_mem_kv: default_num_compressed_mem_kv(),
            norm: default_norm(),
        }
    }
}

impl NsaConfig {
    /// Inner width of the concatenated heads.
    pub fn dim_inner(&self) -> usize {
        self.dim_head * self.heads
    }

    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| NsaError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load configuration from a file, then apply `NSA_*` overrides.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults with `NSA_*` overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        for (key, value) in env::vars() {
            if let Some(field) = key.strip_prefix("NSA_") {
                self.apply_override(&field.to_lowercase(), &value);
            }
        }
    }

    fn apply_override(&mut self, field: &str, value: &str) {
        let slot = match field {
            "dim" => &mut self.dim,
            "dim_head" => &mut self.dim_head,
            "heads" => &mut self.heads,
            "sliding_window_size" => &mut self.sliding_window_size,
            "compress_block_size" => &mut self.compress_block_size,
            "selection_block_size" => &mut self.selection_block_size,
            "num_selected_blocks" => &mut self.num_selected_blocks,
            "num_compressed_mem_kv" => &mut self.num_compressed_mem_kv,
            "norm" => {
                self.norm = value.eq_ignore_ascii_case("true") || value == "1";
                return;
            }
            _ => {
                debug!(field = %field, "Ignoring unknown NSA_ override");
                return;
            }
        };
        match value.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!(field = %field, value = %value, "Ignoring unparsable NSA_ override"),
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        if self.compress_block_size != self.selection_block_size {
            return Err(NsaError::block_size_mismatch(
                self.compress_block_size,
                self.selection_block_size,
            ));
        }
        if self.num_compressed_mem_kv == 0 {
            return Err(NsaError::no_memory_kv());
        }
        if self.num_selected_blocks == 0 {
            return Err(NsaError::Config("num_selected_blocks must be positive".to_string()));
        }
        if self.compress_block_size == 0 {
            return Err(NsaError::Config("compress_block_size must be positive".to_string()));
        }
        if self.dim == 0 || self.dim_head == 0 || self.heads == 0 {
            return Err(NsaError::Config(format!(
                "dim ({}), dim_head ({}) and heads ({}) must be positive",
                self.dim, self.dim_head, self.heads
            )));
        }
        Ok(())
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = NsaConfig::default();
        assert_eq!(config.heads, 8);
        assert_eq!(config.dim_inner(), 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nsa.json");

        let config = NsaConfig {
            num_selected_blocks: 3,
            ..Default::default()
        };
        config.save(&path)?;

        let loaded = NsaConfig::from_file(&path)?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[test]
    fn test_partial_file_uses_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{ "heads": 2, "norm": false }"#)?;

        let loaded = NsaConfig::from_file(&path)?;
        assert_eq!(loaded.heads, 2);
        assert!(!loaded.norm);
        assert_eq!(loaded.compress_block_size, 4);
        Ok(())
    }

    #[test]
    fn test_env_override() {
        env::set_var("NSA_NUM_SELECTED_BLOCKS", "7");
        env::set_var("NSA_NORM", "false");

        let config = NsaConfig::from_env();
        assert_eq!(config.num_selected_blocks, 7);
        assert!(!config.norm);

        env::remove_var("NSA_NUM_SELECTED_BLOCKS");
        env::remove_var("NSA_NORM");
    }

    #[test]
    fn test_override_parsing() {
        let mut config = NsaConfig::default();
        config.apply_override("heads", "sixteen");
        assert_eq!(config.heads, NsaConfig::default().heads);

        config.apply_override("heads", "16");
        config.apply_override("unknown_field", "3");
        assert_eq!(config.heads, 16);

        config.apply_override("norm", "0");
        assert!(!config.norm);
        config.apply_override("norm", "TRUE");
        assert!(config.norm);
    }

    #[test]
    fn test_validation() {
        let mut config = NsaConfig::default();
        config.selection_block_size = 8;
        assert!(matches!(config.validate(), Err(NsaError::Config(_))));

        let mut config = NsaConfig::default();
        config.num_compressed_mem_kv = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("num_compressed_mem_kv"));
    }
}
