//! Host runtime of a system-statistics collection daemon.
//!
//! Plugins register read, write, flush, notification and cache-event
//! callbacks with the [`plugin::Registry`]. Readers are driven by the
//! [`scheduler::ReadScheduler`]; every dispatched value list goes through
//! the [`cache::ValueCache`] before it reaches the writers. The
//! [`aggregation`] plugin builds on the [`lookup::LookupEngine`] to derive
//! per-group statistics, and the [`format`] module renders value lists and
//! notifications for writer plugins.

pub mod adapters;
pub mod aggregation;
pub mod cache;
pub mod config;
pub mod daemon;
pub mod error;
pub mod format;
pub mod identifier;
pub mod logging;
pub mod lookup;
pub mod meta;
pub mod plugin;
pub mod scheduler;
pub mod time;
pub mod types;
pub mod write_log;

pub use config::{ConfigItem, DaemonConfig};
pub use daemon::Daemon;
pub use error::{CollectdError, CollectdResult, ConfigError};
pub use identifier::Identifier;
pub use plugin::Registry;
pub use time::CdTime;
pub use types::{DataSet, Notification, Value, ValueList};
