//! Plugin registry and dispatch.
//!
//! The [`Registry`] is the runtime object every component works through. It
//! owns the data-set table, the value cache, the callback tables, the global
//! settings and the dispatch counters. Callback tables are only changed
//! during configuration and shutdown; every dispatch works on a snapshot so
//! callbacks may re-enter the registry.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use compact_str::CompactString;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEvent, CacheEventKind, ExpiredEntry, ValueCache};
use crate::error::{CollectdError, CollectdResult, ErrorStats};
use crate::identifier::Identifier;
use crate::logging::LogLevel;
use crate::time::CdTime;
use crate::types::{DataSet, DataSetRegistry, Notification, Severity, ValueList};

// ============================================================================
// SECTION 1: CALLBACK TYPES
// ============================================================================

pub type ReadFn = Arc<dyn Fn(&ReadContext<'_>) -> CollectdResult<()> + Send + Sync>;
pub type WriteFn = Arc<dyn Fn(&DataSet, &ValueList) -> CollectdResult<()> + Send + Sync>;
/// Receives the flush timeout and an optional identifier filter.
pub type FlushFn = Arc<dyn Fn(CdTime, Option<&Identifier>) -> CollectdResult<()> + Send + Sync>;
pub type NotificationFn = Arc<dyn Fn(&Notification) -> CollectdResult<()> + Send + Sync>;
pub type InitFn = Arc<dyn Fn() -> CollectdResult<()> + Send + Sync>;
pub type ShutdownFn = Arc<dyn Fn() -> CollectdResult<()> + Send + Sync>;
pub type CacheEventFn = Arc<dyn Fn(&mut CacheEvent<'_>) -> CollectdResult<()> + Send + Sync>;
pub type LogFn = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// A named table entry.
#[derive(Clone)]
pub struct Registered<F> {
    pub name: CompactString,
    pub callback: F,
}

impl<F> fmt::Debug for Registered<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registered").field("name", &self.name).finish()
    }
}

/// A registered read callback.
#[derive(Clone)]
pub struct ReadEntry {
    pub name: CompactString,
    pub callback: ReadFn,
    /// Period of the read; zero means the global interval
    pub interval: CdTime,
    pub group: Option<String>,
}

impl fmt::Debug for ReadEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadEntry")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("group", &self.group)
            .finish()
    }
}

/// What a read callback gets to work with.
pub struct ReadContext<'a> {
    pub registry: &'a Registry,
    pub plugin: &'a str,
    pub interval: CdTime,
}

impl ReadContext<'_> {
    /// Dispatch a value list produced by this read; a zero interval is
    /// replaced by the read's own interval.
    pub fn dispatch(&self, mut vl: ValueList) -> CollectdResult<()> {
        if vl.interval.is_zero() {
            vl.interval = self.interval;
        }
        self.registry.dispatch_values(vl)
    }

    pub fn hostname(&self) -> String {
        self.registry.settings().hostname.clone()
    }
}

// ----------------------------------------------------------------------------
// 1.1 Log Sinks
// ----------------------------------------------------------------------------

/// Log callbacks registered by plugins. Shared with the logging layer.
#[derive(Clone, Default)]
pub struct LogSinks {
    sinks: Arc<RwLock<Vec<Registered<LogFn>>>>,
}

impl LogSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, callback: LogFn) -> CollectdResult<()> {
        register_in(&self.sinks, "log", name, callback)
    }

    pub fn unregister(&self, name: &str) -> CollectdResult<()> {
        unregister_in(&self.sinks, "log", name)
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }

    /// Deliver a message to every sink.
    pub fn dispatch(&self, level: LogLevel, message: &str) {
        for sink in snapshot(&self.sinks) {
            (sink.callback)(level, message);
        }
    }
}

impl fmt::Debug for LogSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSinks")
            .field("count", &self.sinks.read().len())
            .finish()
    }
}

fn register_in<F>(table: &RwLock<Vec<Registered<F>>>, kind: &str, name: &str, callback: F) -> CollectdResult<()> {
    let mut table = table.write();
    if table.iter().any(|r| r.name == name) {
        return Err(CollectdError::duplicate(format!("{} callback '{}'", kind, name)));
    }
    table.push(Registered {
        name: name.into(),
        callback,
    });
    debug!(target: "collectd::plugin", kind, name, "Callback registered");
    Ok(())
}

fn unregister_in<F>(table: &RwLock<Vec<Registered<F>>>, kind: &str, name: &str) -> CollectdResult<()> {
    let mut table = table.write();
    match table.iter().position(|r| r.name == name) {
        Some(idx) => {
            table.remove(idx);
            debug!(target: "collectd::plugin", kind, name, "Callback unregistered");
            Ok(())
        }
        None => Err(CollectdError::not_found(format!("{} callback '{}'", kind, name))),
    }
}

fn snapshot<T: Clone>(table: &RwLock<Vec<T>>) -> Vec<T> {
    table.read().clone()
}

fn names<F>(table: &RwLock<Vec<Registered<F>>>) -> Vec<String> {
    table.read().iter().map(|r| r.name.to_string()).collect()
}

// ============================================================================
// SECTION 2: SETTINGS & STATISTICS
// ============================================================================

/// Global settings, swapped as a whole when the configuration is applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalSettings {
    pub hostname: String,
    pub interval: CdTime,
    pub timeout_factor: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            interval: CdTime::from_secs(10),
            timeout_factor: 2,
        }
    }
}

/// The host name reported by the operating system.
pub fn default_hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    values_dispatched: AtomicU64,
    cache_rejected: AtomicU64,
    values_suppressed: AtomicU64,
    write_errors: AtomicU64,
    notifications_dispatched: AtomicU64,
    notification_errors: AtomicU64,
    reads_executed: AtomicU64,
    reads_failed: AtomicU64,
    reads_skipped: AtomicU64,
    entries_expired: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub values_dispatched: u64,
    pub cache_rejected: u64,
    pub values_suppressed: u64,
    pub write_errors: u64,
    pub notifications_dispatched: u64,
    pub notification_errors: u64,
    pub reads_executed: u64,
    pub reads_failed: u64,
    pub reads_skipped: u64,
    pub entries_expired: u64,
}

impl DispatchStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Count one executed read.
    pub fn record_read(&self, ok: bool) {
        Self::bump(&self.reads_executed);
        if !ok {
            Self::bump(&self.reads_failed);
        }
    }

    /// Count a tick skipped because the previous one was still running.
    pub fn record_skipped_read(&self) {
        Self::bump(&self.reads_skipped);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        let load = |c: &AtomicU64| c.load(AtomicOrdering::Relaxed);
        DispatchStatsSnapshot {
            values_dispatched: load(&self.values_dispatched),
            cache_rejected: load(&self.cache_rejected),
            values_suppressed: load(&self.values_suppressed),
            write_errors: load(&self.write_errors),
            notifications_dispatched: load(&self.notifications_dispatched),
            notification_errors: load(&self.notification_errors),
            reads_executed: load(&self.reads_executed),
            reads_failed: load(&self.reads_failed),
            reads_skipped: load(&self.reads_skipped),
            entries_expired: load(&self.entries_expired),
        }
    }
}

// ============================================================================
// SECTION 3: REGISTRY
// ============================================================================

pub struct Registry {
    settings: ArcSwap<GlobalSettings>,
    data_sets: DataSetRegistry,
    cache: ValueCache,
    reads: RwLock<Vec<ReadEntry>>,
    writes: RwLock<Vec<Registered<WriteFn>>>,
    flushes: RwLock<Vec<Registered<FlushFn>>>,
    notifications: RwLock<Vec<Registered<NotificationFn>>>,
    inits: RwLock<Vec<Registered<InitFn>>>,
    shutdowns: RwLock<Vec<Registered<ShutdownFn>>>,
    cache_events: RwLock<Vec<Registered<CacheEventFn>>>,
    log_sinks: LogSinks,
    stats: DispatchStats,
    errors: ErrorStats,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(GlobalSettings::default())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("settings", &self.settings())
            .field("reads", &names_of_reads(&self.reads))
            .field("writes", &names(&self.writes))
            .field("cache_entries", &self.cache.len())
            .finish()
    }
}

fn names_of_reads(reads: &RwLock<Vec<ReadEntry>>) -> Vec<String> {
    reads.read().iter().map(|r| r.name.to_string()).collect()
}

impl Registry {
    /// A registry with the built-in data sets and no history.
    pub fn new(settings: GlobalSettings) -> Self {
        Self::with_parts(settings, DataSetRegistry::with_builtin_types(), ValueCache::new(), LogSinks::new())
    }

    pub fn with_parts(settings: GlobalSettings, data_sets: DataSetRegistry, cache: ValueCache, log_sinks: LogSinks) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings),
            data_sets,
            cache,
            reads: RwLock::new(Vec::new()),
            writes: RwLock::new(Vec::new()),
            flushes: RwLock::new(Vec::new()),
            notifications: RwLock::new(Vec::new()),
            inits: RwLock::new(Vec::new()),
            shutdowns: RwLock::new(Vec::new()),
            cache_events: RwLock::new(Vec::new()),
            log_sinks,
            stats: DispatchStats::default(),
            errors: ErrorStats::new(),
        }
    }

    pub fn settings(&self) -> Arc<GlobalSettings> {
        self.settings.load_full()
    }

    pub fn set_settings(&self, settings: GlobalSettings) {
        info!(
            target: "collectd::plugin",
            hostname = %settings.hostname,
            interval = %settings.interval,
            timeout_factor = settings.timeout_factor,
            "Global settings applied"
        );
        self.settings.store(Arc::new(settings));
    }

    pub fn data_sets(&self) -> &DataSetRegistry {
        &self.data_sets
    }

    pub fn cache(&self) -> &ValueCache {
        &self.cache
    }

    pub fn log_sinks(&self) -> &LogSinks {
        &self.log_sinks
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn dispatch_stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn errors(&self) -> &ErrorStats {
        &self.errors
    }

    // ------------------------------------------------------------------------
    // 3.1 Registration
    // ------------------------------------------------------------------------

    /// Register a read callback. A zero interval means the global interval.
    pub fn register_read(
        &self,
        name: &str,
        interval: CdTime,
        group: Option<String>,
        callback: ReadFn,
    ) -> CollectdResult<()> {
        let mut reads = self.reads.write();
        if reads.iter().any(|r| r.name == name) {
            return Err(CollectdError::duplicate(format!("read callback '{}'", name)));
        }
        reads.push(ReadEntry {
            name: name.into(),
            callback,
            interval,
            group,
        });
        debug!(target: "collectd::plugin", name, interval = %interval, "Read callback registered");
        Ok(())
    }

    pub fn unregister_read(&self, name: &str) -> CollectdResult<()> {
        let mut reads = self.reads.write();
        match reads.iter().position(|r| r.name == name) {
            Some(idx) => {
                reads.remove(idx);
                Ok(())
            }
            None => Err(CollectdError::not_found(format!("read callback '{}'", name))),
        }
    }

    /// Remove every read of `group`; returns how many were removed.
    pub fn unregister_read_group(&self, group: &str) -> usize {
        let mut reads = self.reads.write();
        let before = reads.len();
        reads.retain(|r| r.group.as_deref() != Some(group));
        before - reads.len()
    }

    pub fn register_write(&self, name: &str, callback: WriteFn) -> CollectdResult<()> {
        register_in(&self.writes, "write", name, callback)
    }

    pub fn unregister_write(&self, name: &str) -> CollectdResult<()> {
        unregister_in(&self.writes, "write", name)
    }

    pub fn register_flush(&self, name: &str, callback: FlushFn) -> CollectdResult<()> {
        register_in(&self.flushes, "flush", name, callback)
    }

    pub fn unregister_flush(&self, name: &str) -> CollectdResult<()> {
        unregister_in(&self.flushes, "flush", name)
    }

    pub fn register_notification(&self, name: &str, callback: NotificationFn) -> CollectdResult<()> {
        register_in(&self.notifications, "notification", name, callback)
    }

    pub fn unregister_notification(&self, name: &str) -> CollectdResult<()> {
        unregister_in(&self.notifications, "notification", name)
    }

    pub fn register_init(&self, name: &str, callback: InitFn) -> CollectdResult<()> {
        register_in(&self.inits, "init", name, callback)
    }

    pub fn register_shutdown(&self, name: &str, callback: ShutdownFn) -> CollectdResult<()> {
        register_in(&self.shutdowns, "shutdown", name, callback)
    }

    pub fn register_cache_event(&self, name: &str, callback: CacheEventFn) -> CollectdResult<()> {
        register_in(&self.cache_events, "cache event", name, callback)
    }

    pub fn unregister_cache_event(&self, name: &str) -> CollectdResult<()> {
        unregister_in(&self.cache_events, "cache event", name)
    }

    pub fn register_log(&self, name: &str, callback: LogFn) -> CollectdResult<()> {
        self.log_sinks.register(name, callback)
    }

    pub fn unregister_log(&self, name: &str) -> CollectdResult<()> {
        self.log_sinks.unregister(name)
    }

    /// Snapshot of the read table in registration order.
    pub fn reads(&self) -> Vec<ReadEntry> {
        snapshot(&self.reads)
    }

    pub fn write_names(&self) -> Vec<String> {
        names(&self.writes)
    }

    pub fn read_names(&self) -> Vec<String> {
        names_of_reads(&self.reads)
    }

    // ------------------------------------------------------------------------
    // 3.2 Value Dispatch
    // ------------------------------------------------------------------------

    /// Fill in defaults and normalize the identifier of an incoming value list.
    fn prepare(&self, vl: &mut ValueList) -> CollectdResult<()> {
        let settings = self.settings.load();
        if vl.identifier.host.is_empty() {
            vl.identifier.host = settings.hostname.as_str().into();
        }
        if vl.time.is_zero() {
            vl.time = CdTime::now();
        }
        if vl.interval.is_zero() {
            vl.interval = settings.interval;
        }
        // Aggregate names carry their template's patterns verbatim.
        if !vl.is_aggregation_created() {
            vl.identifier.escape_slashes();
        }
        vl.identifier.check_lengths()
    }

    fn reject(&self, vl: &ValueList, err: CollectdError) -> CollectdError {
        self.stats.cache_rejected.fetch_add(1, AtomicOrdering::Relaxed);
        self.errors.record(&err);
        warn!(target: "collectd::dispatch", identifier = %vl.identifier, error = %err, "Value list rejected");
        err
    }

    /// Update the cache, notify cache-event subscribers and fan the value
    /// list out to every writer in registration order.
    pub fn dispatch_values(&self, mut vl: ValueList) -> CollectdResult<()> {
        if let Err(err) = self.prepare(&mut vl) {
            return Err(self.reject(&vl, err));
        }
        let ds = match self.data_sets.get(&vl.identifier.type_name) {
            Some(ds) => ds,
            None => {
                let err = CollectdError::not_found(format!("data set '{}'", vl.identifier.type_name));
                return Err(self.reject(&vl, err));
            }
        };
        if let Err(err) = ds.check(&vl) {
            return Err(self.reject(&vl, err));
        }

        let kind = match self.cache.update(&ds, &vl) {
            Ok(kind) => kind,
            Err(err) => return Err(self.reject(&vl, err)),
        };

        let mut event = CacheEvent::for_value_list(kind, &ds, &vl);
        self.emit_cache_event(&mut event);
        if event.ret > 0 {
            self.stats.values_suppressed.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(target: "collectd::dispatch", identifier = %vl.identifier, "Value list suppressed by cache event");
            return Ok(());
        }

        for writer in snapshot(&self.writes) {
            self.call_writer(&writer, &ds, &vl);
        }
        self.stats.values_dispatched.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn call_writer(&self, writer: &Registered<WriteFn>, ds: &DataSet, vl: &ValueList) -> bool {
        match (writer.callback)(ds, vl) {
            Ok(()) => true,
            Err(err) => {
                self.stats.write_errors.fetch_add(1, AtomicOrdering::Relaxed);
                self.errors.record(&err);
                warn!(
                    target: "collectd::dispatch",
                    writer = %writer.name,
                    identifier = %vl.identifier,
                    error = %err,
                    "Write callback failed"
                );
                false
            }
        }
    }

    /// Deliver a value list to one named writer, bypassing the cache.
    pub fn write_to(&self, plugin: &str, ds: &DataSet, vl: &ValueList) -> CollectdResult<()> {
        let writer = self
            .writes
            .read()
            .iter()
            .find(|w| w.name == plugin)
            .cloned()
            .ok_or_else(|| CollectdError::not_found(format!("write callback '{}'", plugin)))?;
        (writer.callback)(ds, vl)
    }

    /// Run cache-event subscribers in order; a subscriber that sets
    /// `ret > 0` ends the chain.
    pub fn emit_cache_event(&self, event: &mut CacheEvent<'_>) {
        for subscriber in snapshot(&self.cache_events) {
            if let Err(err) = (subscriber.callback)(event) {
                self.errors.record(&err);
                warn!(
                    target: "collectd::dispatch",
                    subscriber = %subscriber.name,
                    event = %event.kind,
                    error = %err,
                    "Cache event callback failed"
                );
            }
            if event.ret > 0 {
                break;
            }
        }
    }

    // ------------------------------------------------------------------------
    // 3.3 Notifications
    // ------------------------------------------------------------------------

    /// Fan a notification out to every notification callback.
    pub fn dispatch_notification(&self, mut notification: Notification) -> CollectdResult<()> {
        if notification.time.is_zero() {
            notification.time = CdTime::now();
        }
        if notification.identifier.host.is_empty() {
            notification.identifier.host = self.settings.load().hostname.as_str().into();
        }
        let callbacks = snapshot(&self.notifications);
        if callbacks.is_empty() {
            debug!(target: "collectd::dispatch", message = %notification.message, "No notification callbacks");
        }
        for callback in callbacks {
            if let Err(err) = (callback.callback)(&notification) {
                self.stats.notification_errors.fetch_add(1, AtomicOrdering::Relaxed);
                self.errors.record(&err);
                warn!(
                    target: "collectd::dispatch",
                    callback = %callback.name,
                    error = %err,
                    "Notification callback failed"
                );
            }
        }
        self.stats.notifications_dispatched.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // 3.4 Timeout Sweep
    // ------------------------------------------------------------------------

    /// Expire stale cache entries: MISSING to subscribers and, unless one of
    /// them suppresses it, a FAILURE notification; then EXPIRED once the
    /// entries are gone.
    pub fn check_timeouts(&self, now: CdTime) -> usize {
        let factor = self.settings.load().timeout_factor;
        let expired = self
            .cache
            .check_timeout_at(now, factor, |entry| self.dispatch_missing(entry, now));

        for entry in &expired {
            let mut event = CacheEvent::new(CacheEventKind::Expired, &entry.identifier);
            self.emit_cache_event(&mut event);
        }
        self.stats
            .entries_expired
            .fetch_add(expired.len() as u64, AtomicOrdering::Relaxed);
        expired.len()
    }

    fn dispatch_missing(&self, entry: &ExpiredEntry, now: CdTime) {
        let mut event = CacheEvent::new(CacheEventKind::Missing, &entry.identifier);
        self.emit_cache_event(&mut event);
        if event.ret > 0 {
            return;
        }

        let silent_for = Duration::from_secs((now - entry.last_update).whole_secs());
        let mut notification = Notification::new(
            Severity::Failure,
            entry.identifier.clone(),
            format!(
                "{} has not been updated for {}.",
                entry.name,
                humantime::format_duration(silent_for)
            ),
        )
        .with_time(now);
        notification
            .add_meta_string("last_value_time", entry.last_time.to_rfc3339())
            .add_meta_double("interval", entry.interval.as_secs_f64());

        info!(target: "collectd::dispatch", identifier = %entry.name, "Value is missing");
        if let Err(err) = self.dispatch_notification(notification) {
            error!(target: "collectd::dispatch", identifier = %entry.name, error = %err, "Missing notification failed");
        }
    }

    // ------------------------------------------------------------------------
    // 3.5 Flush, Init & Shutdown
    // ------------------------------------------------------------------------

    /// Flush registered writers, optionally only the one named `plugin`.
    /// Returns the number of callbacks that succeeded.
    pub fn flush(&self, timeout: CdTime, plugin: Option<&str>, ident: Option<&Identifier>) -> CollectdResult<usize> {
        let callbacks: Vec<_> = snapshot(&self.flushes)
            .into_iter()
            .filter(|f| plugin.map_or(true, |p| f.name == p))
            .collect();
        if let (Some(p), true) = (plugin, callbacks.is_empty()) {
            return Err(CollectdError::not_found(format!("flush callback '{}'", p)));
        }

        let mut flushed = 0;
        for callback in callbacks {
            match (callback.callback)(timeout, ident) {
                Ok(()) => flushed += 1,
                Err(err) => {
                    self.errors.record(&err);
                    warn!(target: "collectd::plugin", callback = %callback.name, error = %err, "Flush failed");
                }
            }
        }
        Ok(flushed)
    }

    /// Run init callbacks in registration order. A failing plugin loses its
    /// read callback. Returns the number of failures.
    pub fn init_all(&self) -> usize {
        let mut failures = 0;
        for init in snapshot(&self.inits) {
            if let Err(err) = (init.callback)() {
                failures += 1;
                self.errors.record(&err);
                error!(
                    target: "collectd::plugin",
                    plugin = %init.name,
                    error = %err,
                    "Initialization failed, read callback removed"
                );
                if let Err(err) = self.unregister_read(&init.name) {
                    warn!(
                        target: "collectd::plugin",
                        plugin = %init.name,
                        error = %err,
                        "Failed plugin has no read callback to remove"
                    );
                }
            }
        }
        info!(target: "collectd::plugin", failures, "Plugins initialized");
        failures
    }

    /// Flush everything, run shutdown callbacks in reverse registration
    /// order and drop all registrations and cached values. The read
    /// scheduler must already be stopped.
    pub fn shutdown_all(&self) {
        if let Err(err) = self.flush(CdTime::ZERO, None, None) {
            warn!(target: "collectd::plugin", error = %err, "Final flush failed");
        }

        for shutdown in snapshot(&self.shutdowns).into_iter().rev() {
            if let Err(err) = (shutdown.callback)() {
                self.errors.record(&err);
                error!(target: "collectd::plugin", plugin = %shutdown.name, error = %err, "Shutdown callback failed");
            }
        }

        self.reads.write().clear();
        self.writes.write().clear();
        self.flushes.write().clear();
        self.notifications.write().clear();
        self.inits.write().clear();
        self.shutdowns.write().clear();
        self.cache_events.write().clear();
        self.cache.clear();
        info!(target: "collectd::plugin", stats = ?self.stats.snapshot(), "Registry shut down");
    }

    /// Deliver a message to plugin log sinks only.
    pub fn log(&self, level: LogLevel, message: &str) {
        self.log_sinks.dispatch(level, message);
    }
}

// ============================================================================
// SECTION 4: TESTS
// ============================================================================
