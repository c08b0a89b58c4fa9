//! Logging configuration, subscriber initialization and run lifecycle events.

use std::env;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_VAR: &str = "TOXWATCH_LOG_LEVEL";
pub const LOG_FORMAT_VAR: &str = "TOXWATCH_LOG_FORMAT";
pub const LOG_TARGET_VAR: &str = "TOXWATCH_LOG_TARGET";

const DEFAULT_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL.to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("global tracing subscriber already set: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    logging_config_from_lookup(|key| env::var(key).ok())
}

/// Builds the logging config from any key lookup. Unknown formats and
/// unparseable booleans keep their defaults.
pub fn logging_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Some(level) = lookup(LOG_LEVEL_VAR) {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Some(parsed) = lookup(LOG_FORMAT_VAR).as_deref().and_then(parse_log_format) {
        config.format = parsed;
    }

    if let Some(parsed) = lookup(LOG_TARGET_VAR).as_deref().and_then(parse_bool) {
        config.include_target = parsed;
    }

    config
}

/// Installs the global subscriber. An unparseable filter directive falls back
/// to `info` rather than failing the run.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_target);

    if config.format == LogFormat::Json {
        tracing::subscriber::set_global_default(fmt.with_ansi(false).json().finish())?;
    } else {
        tracing::subscriber::set_global_default(fmt.with_ansi(true).pretty().finish())?;
    }
    Ok(())
}

pub fn log_app_start(config: &LoggingConfig) {
    info!(
        component = "toxwatch_run",
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_config_loaded(source: Option<&Path>, pollutant: &str, folds: usize, vote_cutoff: usize) {
    match source {
        Some(path) => info!(
            component = "toxwatch_run",
            event = "config.loaded",
            source = %path.display(),
            pollutant,
            folds,
            vote_cutoff
        ),
        None => info!(
            component = "toxwatch_run",
            event = "config.loaded",
            source = "defaults",
            pollutant,
            folds,
            vote_cutoff
        ),
    }
}

pub fn log_run_finish(output_dir: &Path, elapsed_ms: u64, events: usize) {
    info!(
        component = "toxwatch_run",
        event = "run.finish",
        output_dir = %output_dir.display(),
        elapsed_ms,
        events
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("json") {
        Some(LogFormat::Json)
    } else if raw.eq_ignore_ascii_case("pretty") || raw.eq_ignore_ascii_case("text") {
        Some(LogFormat::Pretty)
    } else {
        None
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    const TRUTHY: [&str; 4] = ["1", "true", "yes", "on"];
    const FALSY: [&str; 4] = ["0", "false", "no", "off"];
    let raw = raw.trim();
    if TRUTHY.iter().any(|t| raw.eq_ignore_ascii_case(t)) {
        Some(true)
    } else if FALSY.iter().any(|f| raw.eq_ignore_ascii_case(f)) {
        Some(false)
    } else {
        None
    }
}
