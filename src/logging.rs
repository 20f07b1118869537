// ============================================================================
// SECTION 1: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Diagnostics go through `tracing`. The subscriber writes formatted events
// to stdout or a file and forwards every event to the log callbacks plugins
// registered with the registry.
// ============================================================================

use std::cell::Cell;
use std::fmt::{self, Display, Formatter, Write as _};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::{info, Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{fmt as tfmt, EnvFilter, Layer};

use crate::error::{CollectdResult, ConfigError};
use crate::plugin::LogSinks;

// ----------------------------------------------------------------------------
// 1.1 Log Levels
// ----------------------------------------------------------------------------

/// Severity of a log message as seen by plugin log callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warning => Level::WARN,
            LogLevel::Notice | LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
        }
    }

    pub fn from_tracing_level(level: &Level) -> Self {
        match *level {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warning,
            Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }

    pub fn level_filter(&self) -> LevelFilter {
        LevelFilter::from_level(self.to_tracing_level())
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Notice => "notice",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        })
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "notice" => Ok(LogLevel::Notice),
            "info" => Ok(LogLevel::Info),
            "debug" | "trace" => Ok(LogLevel::Debug),
            _ => Err(ConfigError::invalid_value("LogLevel", format!("unknown log level '{}'", s))),
        }
    }
}

// ----------------------------------------------------------------------------
// 1.2 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warning, notice, info or debug
    pub level: String,
    /// json, compact or pretty
    pub format: String,
    /// Write to this file instead of stdout
    pub file: Option<PathBuf>,
    pub colors: bool,
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.level.parse::<LogLevel>()?;
        match self.format.as_str() {
            "json" | "compact" | "pretty" => Ok(()),
            other => Err(ConfigError::invalid_value(
                "Logging.format",
                format!("'{}' is not one of json, compact, pretty", other),
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// 1.3 Plugin Log Forwarding
// ----------------------------------------------------------------------------

thread_local! {
    static FORWARDING: Cell<bool> = Cell::new(false);
}

/// Forwards every event to the registered plugin log callbacks.
#[derive(Debug, Clone)]
pub struct PluginLogLayer {
    sinks: LogSinks,
}

impl PluginLogLayer {
    pub fn new(sinks: LogSinks) -> Self {
        Self { sinks }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for PluginLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if self.sinks.is_empty() {
            return;
        }
        // A sink that logs through tracing must not loop back into itself.
        if FORWARDING.with(|f| f.replace(true)) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.message.push_str(&visitor.fields);
        let level = LogLevel::from_tracing_level(event.metadata().level());
        self.sinks.dispatch(level, &visitor.message);
        FORWARDING.with(|f| f.set(false));
    }
}

// ----------------------------------------------------------------------------
// 1.4 Logger Initialization
// ----------------------------------------------------------------------------

/// Install the global subscriber. The returned guard must live as long as
/// logging is needed; dropping it flushes the background writer.
pub fn init_logging(config: &LoggingConfig, sinks: LogSinks) -> CollectdResult<WorkerGuard> {
    config.validate()?;
    let level: LogLevel = config.level.parse()?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.level_filter().into())
        .from_env_lossy();

    let (writer, guard) = match &config.file {
        Some(path) => {
            let dir = path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| ConfigError::invalid_value("Logging.file", format!("'{}' has no file name", path.display())))?;
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name))
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    let colors = config.colors && config.file.is_none();

    let fmt_layer: Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> = match config.format.as_str() {
        "json" => tfmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
        "pretty" => tfmt::layer()
            .pretty()
            .with_writer(writer)
            .with_ansi(colors)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .boxed(),
        _ => tfmt::layer()
            .compact()
            .with_writer(writer)
            .with_ansi(colors)
            .with_target(true)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .with(PluginLogLayer::new(sinks));
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ConfigError::invalid_value("Logging", format!("failed to install logger: {}", e)))?;

    info!(
        target: "collectd::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );
    Ok(guard)
}

// ============================================================================
// SECTION 2: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use test_case::test_case;

    #[test_case("err", LogLevel::Error)]
    #[test_case("WARNING", LogLevel::Warning)]
    #[test_case("notice", LogLevel::Notice)]
    #[test_case("trace", LogLevel::Debug)]
    fn test_parse_level(input: &str, expected: LogLevel) {
        assert_eq!(input.parse::<LogLevel>().unwrap(), expected);
    }

    #[test]
    fn test_tracing_level_mapping() {
        assert_eq!(LogLevel::Notice.to_tracing_level(), Level::INFO);
        assert_eq!(LogLevel::from_tracing_level(&Level::TRACE), LogLevel::Debug);
        assert_eq!(LogLevel::from_tracing_level(&Level::WARN), LogLevel::Warning);
        assert!(LogLevel::Error < LogLevel::Debug);
    }

    #[test]
    fn test_config_validation() {
        assert!(LoggingConfig::default().validate().is_ok());
        let bad_format = LoggingConfig {
            format: "xml".to_string(),
            ..LoggingConfig::default()
        };
        assert!(bad_format.validate().is_err());
        let bad_level = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(bad_level.validate().is_err());
    }

    #[test]
    fn test_events_reach_plugin_sinks() {
        let sinks = LogSinks::new();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines_in_cb = Arc::clone(&lines);
        sinks
            .register(
                "capture",
                Arc::new(move |level: LogLevel, msg: &str| lines_in_cb.lock().push((level, msg.to_string()))),
            )
            .unwrap();

        let subscriber = tracing_subscriber::registry().with(PluginLogLayer::new(sinks));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(plugin = "cpu", "read failed");
            tracing::debug!("detail");
        });

        let lines = lines.lock();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (LogLevel::Warning, "read failed plugin=cpu".to_string()));
        assert_eq!(lines[1].0, LogLevel::Debug);
    }
}
