//! Subscriber installation.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from
//! [`LogSettings::default_filter`]. Only the first successful install wins.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    /// Human-readable single-line output, for local runs.
    Compact,
}

impl LogFormat {
    /// `"compact"` selects [`LogFormat::Compact`]; anything else is JSON.
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("compact") {
            LogFormat::Compact
        } else {
            LogFormat::Json
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub default_filter: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogSettings {
    /// Defaults, with the format taken from `MODGATE_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let format = lookup("MODGATE_LOG_FORMAT")
            .map(|name| LogFormat::from_name(&name))
            .unwrap_or_default();
        Self::default().with_format(format)
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// `RUST_LOG` if it parses, else the configured default, else `info`.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.default_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the subscriber. Returns `false` if one was already installed.
pub fn init(settings: &LogSettings) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(settings.filter())
        .with_target(false);

    match settings.format {
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init()
            .is_ok(),
        LogFormat::Compact => builder.compact().try_init().is_ok(),
    }
}
