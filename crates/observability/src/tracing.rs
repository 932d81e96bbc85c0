//! Subscriber configuration.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `RUST_LOG` | `info` | `EnvFilter` directives |
//! | `EVENTLINE_LOG_FORMAT` | `json` | `json` or `pretty` |

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    #[default]
    Json,
    /// Human-readable multi-line output for local runs.
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset or unparsable.
    pub default_directive: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_directive: "info".to_string(),
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_format_var(std::env::var("EVENTLINE_LOG_FORMAT").ok().as_deref())
    }

    fn from_format_var(value: Option<&str>) -> Self {
        let format = match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        Self {
            format,
            ..Self::default()
        }
    }
}

/// Install a global `fmt` subscriber. Returns `false` if one was already set.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_directive));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    match config.format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Pretty => builder.pretty().try_init().is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(LogConfig::from_format_var(None).format, LogFormat::Json);
        assert_eq!(LogConfig::from_format_var(Some("xml")).format, LogFormat::Json);
        assert_eq!(LogConfig::from_format_var(Some(" Pretty ")).format, LogFormat::Pretty);
    }

    #[test]
    fn second_init_is_a_no_op() {
        let config = LogConfig::default();
        let _ = init(&config);
        assert!(!init(&config));
        ::tracing::info!(component = "observability", "still logging after re-init");
    }
}
