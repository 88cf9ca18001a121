use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

use crate::ReportError;
use crate::config::LoggingConfig;

static SUBSCRIBER_INSTALLED: OnceLock<()> = OnceLock::new();

const FALLBACK_DIRECTIVE: &str = "info";

/// How the global `tracing` subscriber is installed.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// Filter directive, e.g. `info,deepreport_core=debug`.
    pub directive: Option<String>,
    pub ansi: bool,
    /// Print the event target (module path) on each line.
    pub with_target: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            directive: None,
            ansi: true,
            with_target: false,
        }
    }
}

impl From<&LoggingConfig> for TelemetryOptions {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            directive: Some(config.level.clone()),
            ..Self::default()
        }
    }
}

impl TelemetryOptions {
    /// `RUST_LOG` takes precedence over the configured directive.
    fn resolve_filter(&self, rust_log: Option<String>) -> Result<EnvFilter, ReportError> {
        let directive = rust_log
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.directive.clone())
            .unwrap_or_else(|| FALLBACK_DIRECTIVE.to_string());
        EnvFilter::try_new(&directive).map_err(|err| {
            ReportError::InvalidConfiguration(format!("invalid log filter '{directive}': {err}"))
        })
    }
}

/// Install the global subscriber once; later calls are no-ops.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), ReportError> {
    if SUBSCRIBER_INSTALLED.get().is_some() {
        return Ok(());
    }

    let filter = options.resolve_filter(std::env::var("RUST_LOG").ok())?;
    fmt()
        .with_env_filter(filter)
        .with_ansi(options.ansi)
        .with_target(options.with_target)
        .try_init()
        .map_err(|err| ReportError::InvalidConfiguration(format!("telemetry init failed: {err}")))?;

    SUBSCRIBER_INSTALLED.get_or_init(|| ());
    Ok(())
}
