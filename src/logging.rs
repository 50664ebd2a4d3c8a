//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events; applications and bench
//! harnesses call [`init_from_settings`] (or [`init`]) once to print them.
//!
//! Fields used across the crate: `board`, `channel`, `tick`, `opcode`.
//! Protocol anomalies are logged at `warn`, per-transfer detail at `debug`,
//! init/reset/teardown milestones at `info`. `RUST_LOG` overrides the level.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::StackSettings;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, colored
    Pretty,
    /// Single line per event
    #[default]
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// ANSI colors (pretty format only)
    pub with_ansi: bool,
}

impl LoggingConfig {
    /// Level taken from the stack settings' `log_level`.
    pub fn from_settings(settings: &StackSettings) -> Result<Self, String> {
        let level = settings
            .log_level
            .parse::<Level>()
            .map_err(|_| format!("invalid log level '{}'", settings.log_level))?;
        Ok(Self {
            level,
            format: OutputFormat::default(),
            with_ansi: true,
        })
    }
}

/// Initialize from the stack settings.
pub fn init_from_settings(settings: &StackSettings) -> Result<(), String> {
    init(LoggingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// A subscriber installed earlier (by a test harness or the host
/// application) is left in place and `Ok(())` is returned.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer().pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => fmt::layer().compact().with_ansi(false).boxed(),
        OutputFormat::Json => fmt::layer().json().boxed(),
    };

    if tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .is_err()
    {
        tracing::debug!("Global subscriber already installed");
    }
    Ok(())
}
