//! Logging configuration and initialization
//!
//! One `tracing` subscriber per process, assembled from a [`LogConfig`]:
//! console and/or daily-rotated file output, text or JSON lines, a base level
//! plus per-target directives.
//!
//! Binaries start from a programmatic default and let `LOG_*` variables
//! override it:
//!
//! ```no_run
//! use plantsync_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::builder()
//!         .log_file_prefix("plantsync")
//!         .filter_directives("sqlx=warn")
//!         .build()
//!         .with_env_overrides()?;
//!     let _guard = init_logging(&config)?;
//!
//!     tracing::info!(kind = "shift_add", priority = 0u8, "Record queued");
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        choose(
            "log level",
            s,
            &[
                ("trace", LogLevel::Trace),
                ("debug", LogLevel::Debug),
                ("info", LogLevel::Info),
                ("warn", LogLevel::Warn),
                ("warning", LogLevel::Warn),
                ("error", LogLevel::Error),
            ],
        )
    }
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        choose(
            "log output",
            s,
            &[
                ("console", LogOutput::Console),
                ("stdout", LogOutput::Console),
                ("file", LogOutput::File),
                ("both", LogOutput::Both),
            ],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line, for log shippers
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        choose(
            "log format",
            s,
            &[("text", LogFormat::Text), ("json", LogFormat::Json)],
        )
    }
}

fn choose<T: Copy>(what: &str, input: &str, options: &[(&str, T)]) -> Result<T> {
    let wanted = input.trim().to_ascii_lowercase();
    options
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, value)| *value)
        .ok_or_else(|| anyhow!("Invalid {what}: {input}"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,

    /// Directory for rotated files, used when `output` includes a file
    pub log_dir: PathBuf,
    /// Rotated files are named `<prefix>.<date>`
    pub log_file_prefix: String,

    /// Comma-separated per-target directives, e.g. `sqlx=warn`
    pub filter_directives: Option<String>,

    pub include_location: bool,
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "plantsync".to_string(),
            filter_directives: None,
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

impl LogConfig {
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Defaults overridden by `LOG_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply whichever `LOG_*` variables are set on top of `self`.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `LOG_LEVEL` | `level` |
    /// | `LOG_OUTPUT` | `output` |
    /// | `LOG_FORMAT` | `format` |
    /// | `LOG_DIR` | `log_dir` |
    /// | `LOG_FILE_PREFIX` | `log_file_prefix` |
    /// | `LOG_FILTER` | `filter_directives` |
    /// | `LOG_INCLUDE_LOCATION` | `include_location` |
    /// | `LOG_INCLUDE_THREAD_IDS` | `include_thread_ids` |
    /// | `LOG_INCLUDE_TARGETS` | `include_targets` |
    pub fn with_env_overrides(mut self) -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok();
        let flag = |name: &str| -> Result<Option<bool>> {
            var(name)
                .map(|v| v.trim().parse::<bool>().with_context(|| format!("{name}={v}")))
                .transpose()
        };

        if let Some(level) = var("LOG_LEVEL") {
            self.level = level.parse()?;
        }
        if let Some(output) = var("LOG_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Some(dir) = var("LOG_DIR") {
            self.log_dir = dir.into();
        }
        if let Some(prefix) = var("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Some(filter) = var("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        if let Some(on) = flag("LOG_INCLUDE_LOCATION")? {
            self.include_location = on;
        }
        if let Some(on) = flag("LOG_INCLUDE_THREAD_IDS")? {
            self.include_thread_ids = on;
        }
        if let Some(on) = flag("LOG_INCLUDE_TARGETS")? {
            self.include_targets = on;
        }

        Ok(self)
    }
}

#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    /// File, line, thread id and target toggles in one call.
    pub fn metadata(mut self, location: bool, thread_ids: bool, targets: bool) -> Self {
        self.config.include_location = location;
        self.config.include_thread_ids = thread_ids;
        self.config.include_targets = targets;
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Keeps the non-blocking file writer flushing until dropped.
///
/// Hold it in `main` for the lifetime of the process.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let filter = build_filter(config)?;

    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    let mut file_guard = None;

    if config.output.console() {
        layers.push(fmt_layer(config, std::io::stdout, true));
    }

    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create log directory {}", config.log_dir.display())
        })?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        layers.push(fmt_layer(config, writer, false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Global tracing subscriber already installed")?;

    Ok(LogGuard { _file: file_guard })
}

fn build_filter(config: &LogConfig) -> Result<EnvFilter> {
    let base = Level::from(config.level);
    let mut filter = EnvFilter::from_default_env().add_directive(base.into());

    let directives = config.filter_directives.as_deref().unwrap_or_default();
    for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        let parsed = directive
            .parse()
            .with_context(|| format!("Invalid filter directive: {directive}"))?;
        filter = filter.add_directive(parsed);
    }

    Ok(filter)
}

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 4] = ["LOG_LEVEL", "LOG_OUTPUT", "LOG_FILTER", "LOG_INCLUDE_TARGETS"];

    fn clear_env() {
        for name in VARS {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_choices_parse_case_insensitively() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("stdout".parse::<LogOutput>().unwrap(), LogOutput::Console);
        assert_eq!(" Json ".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert!("syslog".parse::<LogOutput>().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_only_what_is_set() {
        clear_env();
        std::env::set_var("LOG_LEVEL", "debug");
        std::env::set_var("LOG_INCLUDE_TARGETS", "false");

        let config = LogConfig::builder()
            .log_file_prefix("bridge")
            .filter_directives("sqlx=warn")
            .build()
            .with_env_overrides()
            .unwrap();
        clear_env();

        assert_eq!(config.level, LogLevel::Debug);
        assert!(!config.include_targets);
        assert_eq!(config.log_file_prefix, "bridge");
        assert_eq!(config.filter_directives.as_deref(), Some("sqlx=warn"));
    }

    #[test]
    #[serial]
    fn test_bad_env_value_is_an_error() {
        clear_env();
        std::env::set_var("LOG_OUTPUT", "syslog");
        let result = LogConfig::from_env();
        clear_env();
        assert!(result.is_err());
    }

    #[test]
    fn test_filter_rejects_malformed_directive() {
        let config = LogConfig::builder().filter_directives("sqlx=loud").build();
        assert!(build_filter(&config).is_err());

        let config = LogConfig::builder()
            .filter_directives("sqlx=warn, ,plantsync_bridge=debug")
            .build();
        assert!(build_filter(&config).is_ok());
    }

    #[test]
    fn test_output_targets() {
        assert!(LogOutput::Both.console() && LogOutput::Both.file());
        assert!(!LogOutput::Console.file());
        assert!(!LogOutput::File.console());
    }
}
