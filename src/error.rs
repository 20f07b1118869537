// ============================================================================
// SECTION 1: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error type for the whole runtime. Variants follow the daemon's error
// taxonomy; configuration problems live in a nested enum so that startup
// code can match on them separately.
// ============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use thiserror::Error;

use crate::time::CdTime;

// ----------------------------------------------------------------------------
// 1.1 Core Errors
// ----------------------------------------------------------------------------

/// The main error type of the runtime.
#[derive(Error, Debug)]
pub enum CollectdError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Value of {name} is stale (state missing)")]
    Stale { name: String },

    #[error("Duplicate registration: {what}")]
    Duplicate { what: String },

    #[error("Type mismatch for '{key}': requested {requested}, stored {stored}")]
    TypeMismatch {
        key: String,
        requested: &'static str,
        stored: &'static str,
    },

    #[error("Invariant violated: {message}")]
    InvariantViolated { message: String },

    #[error("Time regression for {name}: time {time} is not after last time {last_time}")]
    TimeRegression {
        name: String,
        time: CdTime,
        last_time: CdTime,
    },

    #[error("Invalid regular expression '{pattern}': {message}")]
    RegexInvalid { pattern: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of memory: {context}")]
    OutOfMemory { context: String },

    #[error("Timed out: {operation}")]
    Timeout { operation: String },

    #[error("Remote rejected: {message}")]
    RemoteRejected { message: String },

    #[error("Callback '{name}' failed: {message}")]
    CallbackError { name: String, message: String },

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl CollectdError {
    pub fn not_found(what: impl Into<String>) -> Self {
        CollectdError::NotFound { what: what.into() }
    }

    pub fn duplicate(what: impl Into<String>) -> Self {
        CollectdError::Duplicate { what: what.into() }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        CollectdError::InvariantViolated {
            message: message.into(),
        }
    }

    pub fn callback(name: impl Into<String>, message: impl Into<String>) -> Self {
        CollectdError::CallbackError {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn out_of_memory(context: impl Into<String>) -> Self {
        CollectdError::OutOfMemory {
            context: context.into(),
        }
    }

    pub fn remote_rejected(message: impl Into<String>) -> Self {
        CollectdError::RemoteRejected {
            message: message.into(),
        }
    }

    /// Per-sample errors are recoverable: the sample is dropped and the
    /// daemon carries on. Everything else stops startup.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CollectdError::Config(_) => false,
            CollectdError::NotFound { .. } => true,
            CollectdError::Stale { .. } => true,
            CollectdError::Duplicate { .. } => false,
            CollectdError::TypeMismatch { .. } => true,
            CollectdError::InvariantViolated { .. } => true,
            CollectdError::TimeRegression { .. } => true,
            CollectdError::RegexInvalid { .. } => false,
            CollectdError::Io(_) => true,
            CollectdError::OutOfMemory { .. } => true,
            CollectdError::Timeout { .. } => true,
            CollectdError::RemoteRejected { .. } => true,
            CollectdError::CallbackError { .. } => true,
            CollectdError::ShuttingDown => false,
        }
    }

    /// Stable label for logs and counters.
    pub fn category(&self) -> &'static str {
        match self {
            CollectdError::Config(_) => "config",
            CollectdError::NotFound { .. } => "not_found",
            CollectdError::Stale { .. } => "stale",
            CollectdError::Duplicate { .. } => "duplicate",
            CollectdError::TypeMismatch { .. } => "type_mismatch",
            CollectdError::InvariantViolated { .. } => "invariant_violated",
            CollectdError::TimeRegression { .. } => "time_regression",
            CollectdError::RegexInvalid { .. } => "regex_invalid",
            CollectdError::Io(_) => "io",
            CollectdError::OutOfMemory { .. } => "out_of_memory",
            CollectdError::Timeout { .. } => "timeout",
            CollectdError::RemoteRejected { .. } => "remote_rejected",
            CollectdError::CallbackError { .. } => "callback",
            CollectdError::ShuttingDown => "shutdown",
        }
    }

    /// Process exit code for an error that ends startup.
    pub fn exit_code(&self) -> i32 {
        match self {
            CollectdError::Config(_)
            | CollectdError::RegexInvalid { .. }
            | CollectdError::Duplicate { .. } => EXIT_CONFIG_ERROR,
            CollectdError::OutOfMemory { .. } => EXIT_OUT_OF_MEMORY,
            _ => EXIT_RUNTIME_ERROR,
        }
    }
}

/// Normal shutdown.
pub const EXIT_SUCCESS: i32 = 0;
/// The configuration could not be loaded or is invalid.
pub const EXIT_CONFIG_ERROR: i32 = 1;
/// A runtime failure before initialization completed.
pub const EXIT_RUNTIME_ERROR: i32 = 2;
/// Allocation failure during startup.
pub const EXIT_OUT_OF_MEMORY: i32 = 3;

// ----------------------------------------------------------------------------
// 1.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Unknown plugin: {name}")]
    UnknownPlugin { name: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 1.3 Result Type Aliases
// ----------------------------------------------------------------------------

/// Result type used throughout the runtime.
pub type CollectdResult<T> = Result<T, CollectdError>;

/// Result type for configuration parsing.
pub type ConfigResult<T> = Result<T, ConfigError>;

// ----------------------------------------------------------------------------
// 1.4 Error Statistics
// ----------------------------------------------------------------------------

const CATEGORIES: [&str; 14] = [
    "config",
    "not_found",
    "stale",
    "duplicate",
    "type_mismatch",
    "invariant_violated",
    "time_regression",
    "regex_invalid",
    "io",
    "out_of_memory",
    "timeout",
    "remote_rejected",
    "callback",
    "shutdown",
];

/// Error counters, one per category.
#[derive(Debug, Default)]
pub struct ErrorStats {
    by_category: [AtomicU64; CATEGORIES.len()],
    recoverable_count: AtomicU64,
    non_recoverable_count: AtomicU64,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error.
    pub fn record(&self, error: &CollectdError) {
        let category = error.category();
        if let Some(idx) = CATEGORIES.iter().position(|c| *c == category) {
            self.by_category[idx].fetch_add(1, AtomicOrdering::Relaxed);
        }
        if error.is_recoverable() {
            self.recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.non_recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    pub fn total_errors(&self) -> u64 {
        self.recoverable_count.load(AtomicOrdering::Relaxed)
            + self.non_recoverable_count.load(AtomicOrdering::Relaxed)
    }

    pub fn count_by_category(&self, category: &str) -> u64 {
        CATEGORIES
            .iter()
            .position(|c| *c == category)
            .map(|idx| self.by_category[idx].load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    pub fn summary(&self) -> ErrorStatsSummary {
        ErrorStatsSummary {
            total: self.total_errors(),
            recoverable: self.recoverable_count.load(AtomicOrdering::Relaxed),
            non_recoverable: self.non_recoverable_count.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorStatsSummary {
    pub total: u64,
    pub recoverable: u64,
    pub non_recoverable: u64,
}

// ============================================================================
// SECTION 2: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config: CollectdError = ConfigError::missing_field("Type").into();
        assert_eq!(config.exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(CollectdError::out_of_memory("history").exit_code(), EXIT_OUT_OF_MEMORY);
        assert_eq!(CollectdError::callback("cpu", "init failed").exit_code(), EXIT_RUNTIME_ERROR);
    }

    #[test]
    fn test_error_stats_counts_by_category() {
        let stats = ErrorStats::new();
        stats.record(&CollectdError::not_found("host/cpu/cpu"));
        stats.record(&CollectdError::not_found("host/cpu/load"));
        stats.record(&CollectdError::ShuttingDown);

        assert_eq!(stats.count_by_category("not_found"), 2);
        assert_eq!(stats.count_by_category("shutdown"), 1);
        assert_eq!(stats.count_by_category("bogus"), 0);
        assert_eq!(
            stats.summary(),
            ErrorStatsSummary {
                total: 3,
                recoverable: 2,
                non_recoverable: 1
            }
        );
    }

    #[test]
    fn test_display_messages() {
        let err = CollectdError::TimeRegression {
            name: "h/p/t".into(),
            time: CdTime::from_secs(5),
            last_time: CdTime::from_secs(10),
        };
        assert_eq!(
            err.to_string(),
            "Time regression for h/p/t: time 5.000 is not after last time 10.000"
        );
    }
}
