//! `tracing` subscriber setup for the chainscan binary and tests.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

/// Console output style
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    #[default]
    Compact,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base filter directive, e.g. `info` or `chainscan_core=debug,info`.
    /// `RUST_LOG` is appended to it.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
    pub console_logging: bool,
    /// Also write plain-text logs to `log_dir/log_file`, rotated daily.
    pub file_logging: bool,
    pub log_dir: PathBuf,
    pub log_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            include_target: true,
            console_logging: true,
            file_logging: false,
            log_dir: PathBuf::from("logs"),
            log_file: "chainscan.log".to_string(),
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> anyhow::Result<EnvFilter> {
        let directives = match std::env::var("RUST_LOG") {
            Ok(extra) if !extra.trim().is_empty() => format!("{},{}", self.level, extra),
            _ => self.level.clone(),
        };
        Ok(EnvFilter::try_new(directives)?)
    }
}

fn console_layer<S>(format: LogFormat, include_target: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer().with_target(include_target);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

/// Installs the global subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = config.filter()?;

    let console: Option<Box<dyn Layer<Registry> + Send + Sync>> = config
        .console_logging
        .then(|| console_layer(config.format, config.include_target));

    let (file, guard) = if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(&config.log_dir, &config.log_file));
        let layer = fmt::layer()
            .with_ansi(false)
            .with_target(config.include_target)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // EnvFilter acts globally whatever its position in the stack
    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(filter)
        .try_init()?;

    tracing::info!("Logging initialized ({}, {:?})", config.level, config.format);
    Ok(guard)
}

/// Captured-output subscriber for tests. Only the first call installs it.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("debug"))
        .try_init();
}
