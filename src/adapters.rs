// ============================================================================
// SECTION 1: PLUGIN ADAPTERS
// ============================================================================
// Glue between plugins and the runtime:
// - the table of built-in plugin modules `LoadPlugin` resolves names against
// - a buffered writer that batches value lists as a JSON array and ships
//   them through a `Sink` (a socket, an HTTP client, a log line)
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::aggregation::{self, Aggregator};
use crate::config::{ConfigItem, LoadPluginConfig};
use crate::error::{CollectdError, CollectdResult, ConfigError, ConfigResult};
use crate::format::{FormatError, JsonBuffer};
use crate::identifier::Identifier;
use crate::plugin::Registry;
use crate::time::CdTime;
use crate::types::{DataSet, ValueList};
use crate::write_log::WriteLogModule;

// ----------------------------------------------------------------------------
// 1.1 Plugin Modules
// ----------------------------------------------------------------------------

/// A plugin linked into the daemon. `load` reads the plugin's `Plugin`
/// block, if any, and registers its callbacks.
pub trait PluginModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self, registry: &Arc<Registry>, block: Option<&ConfigItem>, load: &LoadPluginConfig) -> CollectdResult<()>;
}

struct AggregationModule;

impl PluginModule for AggregationModule {
    fn name(&self) -> &'static str {
        aggregation::PLUGIN_NAME
    }

    fn load(&self, registry: &Arc<Registry>, block: Option<&ConfigItem>, load: &LoadPluginConfig) -> CollectdResult<()> {
        let empty = ConfigItem::new("Plugin");
        let aggregator = Aggregator::from_config(Arc::downgrade(registry), block.unwrap_or(&empty))?;
        Arc::new(aggregator).register(registry, load.interval.unwrap_or(CdTime::ZERO))
    }
}

static BUILTIN_MODULES: Lazy<Vec<Box<dyn PluginModule>>> =
    Lazy::new(|| vec![Box::new(AggregationModule), Box::new(WriteLogModule)]);

/// Resolve a `LoadPlugin` name.
pub fn find_module(name: &str) -> ConfigResult<&'static dyn PluginModule> {
    BUILTIN_MODULES
        .iter()
        .find(|m| m.name() == name)
        .map(|m| m.as_ref())
        .ok_or_else(|| ConfigError::UnknownPlugin { name: name.to_string() })
}

pub fn module_names() -> Vec<&'static str> {
    BUILTIN_MODULES.iter().map(|m| m.name()).collect()
}

// ----------------------------------------------------------------------------
// 1.2 Sinks
// ----------------------------------------------------------------------------

/// Where a [`BufferedWriter`] ships its payloads.
pub trait Sink: Send {
    fn connect(&mut self) -> CollectdResult<()>;

    fn send(&mut self, payload: &str) -> CollectdResult<()>;

    fn close(&mut self);
}

/// Logs every payload at INFO.
#[derive(Debug, Clone)]
pub struct LogSink {
    plugin: String,
}

impl LogSink {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self { plugin: plugin.into() }
    }
}

impl Sink for LogSink {
    fn connect(&mut self) -> CollectdResult<()> {
        Ok(())
    }

    fn send(&mut self, payload: &str) -> CollectdResult<()> {
        info!(target: "collectd::write", plugin = %self.plugin, "{}", payload);
        Ok(())
    }

    fn close(&mut self) {}
}

// ----------------------------------------------------------------------------
// 1.3 Buffered Writer
// ----------------------------------------------------------------------------

pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const MIN_RECONNECT_INTERVAL: CdTime = CdTime::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedWriterOptions {
    pub buffer_size: usize,
    /// Minimum time between two connection attempts
    pub reconnect_interval: CdTime,
    /// Write non-gauge sources as rates
    pub store_rates: bool,
}

impl Default for BufferedWriterOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            reconnect_interval: MIN_RECONNECT_INTERVAL,
            store_rates: false,
        }
    }
}

struct WriterState<S> {
    sink: S,
    connected: bool,
    last_connect_attempt: Option<CdTime>,
    buffer: JsonBuffer,
    /// When the oldest buffered record was added
    oldest: Option<CdTime>,
}

impl<S: Sink> WriterState<S> {
    fn ensure_connected(&mut self, name: &str, now: CdTime, reconnect_interval: CdTime) -> CollectdResult<()> {
        if self.connected {
            return Ok(());
        }
        if let Some(last) = self.last_connect_attempt {
            if now.saturating_sub(last) < reconnect_interval {
                return Err(CollectdError::Timeout {
                    operation: format!("reconnect of '{}' deferred, last attempt {} ago", name, now.saturating_sub(last)),
                });
            }
        }
        self.last_connect_attempt = Some(now);
        self.sink.connect()?;
        self.connected = true;
        debug!(target: "collectd::write", writer = name, "Sink connected");
        Ok(())
    }

    /// Ship the buffer and start a new one. The buffer is reset whether or
    /// not sending succeeds.
    fn send_buffer(&mut self, name: &str, now: CdTime, reconnect_interval: CdTime) -> CollectdResult<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let records = self.buffer.records();
        let result = self.ensure_connected(name, now, reconnect_interval).and_then(|()| {
            let payload = self.buffer.finalize();
            self.sink.send(payload)
        });
        self.buffer.initialize();
        self.oldest = None;

        match result {
            Ok(()) => Ok(records),
            Err(err) => {
                if self.connected {
                    self.sink.close();
                    self.connected = false;
                }
                warn!(target: "collectd::write", writer = name, records, error = %err, "Sending failed, records dropped");
                Err(err)
            }
        }
    }
}

/// Batches value lists into a JSON array and ships it through `S` when the
/// buffer fills up or on flush.
pub struct BufferedWriter<S> {
    name: String,
    options: BufferedWriterOptions,
    state: Mutex<WriterState<S>>,
}

impl<S: Sink> BufferedWriter<S> {
    pub fn new(name: impl Into<String>, sink: S, options: BufferedWriterOptions) -> Self {
        let buffer = JsonBuffer::new(options.buffer_size);
        Self {
            name: name.into(),
            options,
            state: Mutex::new(WriterState {
                sink,
                connected: false,
                last_connect_attempt: None,
                buffer,
                oldest: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &BufferedWriterOptions {
        &self.options
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.records()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn write(&self, ds: &DataSet, vl: &ValueList, rates: Option<&[f64]>) -> CollectdResult<()> {
        self.write_at(ds, vl, rates, CdTime::now())
    }

    /// Append one value list. A full buffer is shipped and the value list
    /// is tried once more. Aggregates are never written back out.
    pub fn write_at(&self, ds: &DataSet, vl: &ValueList, rates: Option<&[f64]>, now: CdTime) -> CollectdResult<()> {
        if vl.is_aggregation_created() {
            return Ok(());
        }
        let mut state = self.state.lock();
        match state.buffer.value_list(ds, vl, rates) {
            Ok(()) => {}
            Err(FormatError::BufferFull { .. }) => {
                state.send_buffer(&self.name, now, self.options.reconnect_interval)?;
                state.buffer.value_list(ds, vl, rates)?;
            }
            Err(err) => return Err(err.into()),
        }
        state.oldest.get_or_insert(now);
        Ok(())
    }

    pub fn flush(&self, timeout: CdTime) -> CollectdResult<usize> {
        self.flush_at(timeout, CdTime::now())
    }

    /// Ship the buffer unless its oldest record is younger than `timeout`.
    /// A zero timeout always ships. Returns the number of records sent.
    pub fn flush_at(&self, timeout: CdTime, now: CdTime) -> CollectdResult<usize> {
        let mut state = self.state.lock();
        if let Some(oldest) = state.oldest {
            if !timeout.is_zero() && oldest + timeout > now {
                return Ok(0);
            }
        }
        state.send_buffer(&self.name, now, self.options.reconnect_interval)
    }

    /// Ship what is left and close the sink.
    pub fn close(&self) -> CollectdResult<()> {
        let result = self.flush(CdTime::ZERO).map(|_| ());
        let mut state = self.state.lock();
        if state.connected {
            state.sink.close();
            state.connected = false;
        }
        result
    }
}

impl<S: Sink + 'static> BufferedWriter<S> {
    /// Register write, flush and shutdown callbacks under the writer's name.
    pub fn register(self: Arc<Self>, registry: &Arc<Registry>) -> CollectdResult<()> {
        let writer = Arc::clone(&self);
        let weak: Weak<Registry> = Arc::downgrade(registry);
        registry.register_write(
            &self.name,
            Arc::new(move |ds: &DataSet, vl: &ValueList| {
                if vl.is_aggregation_created() {
                    return Ok(());
                }
                let rates = match (writer.options.store_rates, weak.upgrade()) {
                    (true, Some(registry)) => Some(registry.cache().get_rate(&vl.identifier)?),
                    _ => None,
                };
                writer.write(ds, vl, rates.as_deref())
            }),
        )?;

        let writer = Arc::clone(&self);
        registry.register_flush(
            &self.name,
            Arc::new(move |timeout: CdTime, _ident: Option<&Identifier>| writer.flush(timeout).map(|_| ())),
        )?;

        let writer = Arc::clone(&self);
        registry.register_shutdown(&self.name, Arc::new(move || writer.close()))?;
        Ok(())
    }
}

impl<S> fmt::Debug for BufferedWriter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedWriter")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

// ============================================================================
// SECTION 2: TESTS
// ============================================================================
