use tracing_subscriber::EnvFilter;

use crate::config;

/// Output format of the log stream, chosen with `SG_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(config::optional_env("SG_LOG_FORMAT").as_deref())
    }

    /// Unknown values keep JSON, the format log shippers expect.
    fn parse(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("pretty") => Self::Pretty,
            Some("compact") | Some("text") => Self::Compact,
            _ => Self::Json,
        }
    }
}

pub fn init(service_name: &str) {
    init_with(service_name, LogFormat::from_env());
}

/// Installs the global subscriber. Later calls are no-ops, so tests and
/// one-shot jobs can call it freely.
pub fn init_with(service_name: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let initialized = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    }
    .is_ok();

    if initialized {
        tracing::info!(service = service_name, format = ?format, "logging initialized");
    }
}
