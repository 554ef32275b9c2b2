//! Logging setup for the demo binary and for host applications embedding the layer.
//!
//! The attention code only emits `tracing` events; nothing is printed unless a
//! subscriber is installed through one of these helpers (or by the host).
//! Without `RUST_LOG`, this crate logs at `info` and everything else at `warn`.

use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "warn,native_sparse_attention=info";

/// Output format, chosen with `NSA_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// JSON lines; per-stage shape fields stay machine readable
    Json,
    Compact,
}

impl LogFormat {
    /// Parse a format name, falling back to `Pretty` for anything unknown.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }

    pub fn from_env() -> Self {
        std::env::var("NSA_LOG_FORMAT")
            .map(|name| Self::parse(&name))
            .unwrap_or_default()
    }
}

/// Install a global subscriber. Later calls leave the first one in place.
pub fn init_logging_with_format(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = fmt().with_env_filter(filter);

    let _ = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Compact => builder.compact().with_target(false).try_init(),
    };
}

/// Install a global subscriber in the format named by `NSA_LOG_FORMAT`.
pub fn init_logging_from_env() {
    init_logging_with_format(LogFormat::from_env());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("whatever"), LogFormat::Pretty);
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn test_repeated_init_does_not_panic() {
        init_logging_with_format(LogFormat::Compact);
        init_logging_with_format(LogFormat::Json);
    }
}
