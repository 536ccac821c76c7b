//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events. Binaries and test harnesses
//! call [`init_tracing`] once to install a subscriber.

use crate::{ConfigError, QuickFundResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "quickfund_storage=info,quickfund_core=info,warn";

/// Logging configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `quickfund_storage=debug`
    pub filter: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// # Environment Variables
    /// - `QUICKFUND_LOG`: filter directives (default: `quickfund_storage=info,quickfund_core=info,warn`)
    /// - `QUICKFUND_LOG_JSON`: `1`/`true` for JSON output (default: false)
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var("QUICKFUND_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
            json: std::env::var("QUICKFUND_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Fails if the filter does not parse or a subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> QuickFundResult<()> {
    let env_filter = EnvFilter::try_new(&config.filter).map_err(|e| ConfigError::InvalidValue {
        field: "QUICKFUND_LOG".to_string(),
        value: config.filter.clone(),
        reason: e.to_string(),
    })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    result.map_err(|e| ConfigError::TelemetryInit {
        reason: e.to_string(),
    })?;

    tracing::debug!(filter = %config.filter, json = config.json, "tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QuickFundError;

    #[test]
    fn test_invalid_filter_rejected() {
        let config = TelemetryConfig {
            filter: "quickfund_storage=[".to_string(),
            json: false,
        };
        assert!(matches!(
            init_tracing(&config),
            Err(QuickFundError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig::default();
        // The first call may lose the race against another test; the second never succeeds.
        let _ = init_tracing(&config);
        assert!(matches!(
            init_tracing(&config),
            Err(QuickFundError::Config(ConfigError::TelemetryInit { .. }))
        ));
    }
}
