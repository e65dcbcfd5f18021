//! Structured logging configuration.

use std::path::PathBuf;
use std::str::FromStr;

/// Default filter when neither `POOLKEEPER_LOG` nor `RUST_LOG` is set.
const DEFAULT_FILTER: &str = "poolkeeper=info,warn";

/// Filter used when verbose output is requested.
const VERBOSE_FILTER: &str = "poolkeeper=debug,info";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directives.
    pub filter: String,
    /// Optional file to append to instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: DEFAULT_FILTER.to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Builds logging configuration from environment variables.
    ///
    /// Reads `POOLKEEPER_LOG_FORMAT`, `POOLKEEPER_LOG` (falling back to
    /// `RUST_LOG`) and `POOLKEEPER_LOG_FILE`. `verbose` only raises the
    /// default filter; explicit directives win.
    #[must_use]
    pub fn from_env(verbose: bool) -> Self {
        let mut config = Self::default();
        if verbose {
            config.filter = VERBOSE_FILTER.to_string();
        }

        // Unknown formats keep the default; no subscriber exists yet to warn.
        if let Ok(v) = std::env::var("POOLKEEPER_LOG_FORMAT")
            && let Ok(format) = v.parse()
        {
            config.format = format;
        }
        if let Some(filter) = ["POOLKEEPER_LOG", "RUST_LOG"]
            .iter()
            .filter_map(|key| std::env::var(key).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
        {
            config.filter = filter;
        }
        if let Ok(v) = std::env::var("POOLKEEPER_LOG_FILE")
            && !v.trim().is_empty()
        {
            config.file = Some(PathBuf::from(v.trim()));
        }

        config
    }

    /// Sets the output format.
    #[must_use]
    pub const fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the filter directives.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Sets the log file.
    #[must_use]
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }
}
