//! Log output for binaries and demos built on uboxprims.
//!
//! Library code only emits `tracing` events; nothing is printed until a
//! subscriber is installed here or by the application.

use std::fmt;
use std::str::FromStr;

use tracing::level_filters::LevelFilter;

/// Environment variable holding the log level (`error` .. `trace`).
pub const LOG_LEVEL_ENV: &str = "UBOXPRIMS_LOG";

/// Environment variable holding the log format (`text` or `json`).
pub const LOG_FORMAT_ENV: &str = "UBOXPRIMS_LOG_FORMAT";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

/// A log format or level name that is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSetting(pub String);

impl fmt::Display for UnknownSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown log setting: {}", self.0)
    }
}

impl std::error::Error for UnknownSetting {}

impl FromStr for LogFormat {
    type Err = UnknownSetting;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(UnknownSetting(s.to_string())),
        }
    }
}

impl FromStr for LogLevel {
    type Err = UnknownSetting;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(UnknownSetting(s.to_string())),
        }
    }
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Install a stderr subscriber. A subscriber that is already installed wins.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level.as_filter())
        .with_ansi(false)
        .with_target(false);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}

/// [`init_logging`] configured from [`LOG_FORMAT_ENV`] and [`LOG_LEVEL_ENV`].
///
/// Unset or unrecognized values fall back to text output at `warn`.
pub fn init_logging_from_env() {
    let (format, level) = settings_from(
        std::env::var(LOG_FORMAT_ENV).ok().as_deref(),
        std::env::var(LOG_LEVEL_ENV).ok().as_deref(),
    );
    init_logging(format, level);
}

fn settings_from(format: Option<&str>, level: Option<&str>) -> (LogFormat, LogLevel) {
    let format = format.and_then(|s| s.parse().ok()).unwrap_or_default();
    let level = level.and_then(|s| s.parse().ok()).unwrap_or_default();
    (format, level)
}
