//! Process-wide tracing setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. Returns an error if one is already installed.
pub fn try_init_logging(format: LogFormat) -> Result<(), tracing_subscriber::util::TryInitError> {
    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter())
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter())
            .try_init(),
    }
}

/// Installs the global subscriber, ignoring a second initialisation.
pub fn init_logging(format: LogFormat) {
    if try_init_logging(format).is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(LogFormat::Text);
        init_logging(LogFormat::Json);
        assert!(try_init_logging(LogFormat::Text).is_err());
    }
}
