//! The `write_log` plugin: renders value lists through the Graphite or JSON
//! formatter and notifications as JSON alerts, and logs them at INFO.
//!
//! ```toml
//! [Plugin.write_log]
//! Format = "graphite"        # or "json"
//! Prefix = "collectd."
//! StoreRates = true
//! BufferSize = 0             # > 0 batches JSON output until flush
//! ```
//!
//! Value lists flagged `aggregation:created` are skipped.

use std::str::FromStr;
use std::sync::{Arc, Weak};

use tracing::{info, warn};

use crate::adapters::{BufferedWriter, BufferedWriterOptions, LogSink, PluginModule};
use crate::config::{ConfigItem, LoadPluginConfig};
use crate::error::{CollectdResult, ConfigError, ConfigResult};
use crate::format::json::value_list_to_json;
use crate::format::{format_alert, GraphiteFormatter, GraphiteOptions};
use crate::identifier::Identifier;
use crate::plugin::Registry;
use crate::time::CdTime;
use crate::types::{DataSet, Notification, ValueList};

pub const PLUGIN_NAME: &str = "write_log";

// ============================================================================
// SECTION 1: CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Graphite,
    Json,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "graphite" => Ok(OutputFormat::Graphite),
            "json" => Ok(OutputFormat::Json),
            _ => Err(ConfigError::invalid_value(
                "Format",
                format!("unknown format '{}', expected graphite or json", s),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteLogConfig {
    pub format: OutputFormat,
    pub graphite: GraphiteOptions,
    pub store_rates: bool,
    /// Zero logs every value list on its own
    pub buffer_size: usize,
}

impl WriteLogConfig {
    pub fn from_item(block: &ConfigItem) -> ConfigResult<Self> {
        let mut config = Self::default();
        for child in &block.children {
            match child.key.to_ascii_lowercase().as_str() {
                "format" => config.format = child.string()?.parse()?,
                "prefix" => config.graphite.prefix = child.string()?.to_string(),
                "postfix" => config.graphite.postfix = child.string()?.to_string(),
                "escapecharacter" => {
                    let s = child.string()?;
                    let mut chars = s.chars();
                    config.graphite.escape_char = match (chars.next(), chars.next()) {
                        (Some(c), None) => c,
                        _ => {
                            return Err(ConfigError::invalid_value(
                                "EscapeCharacter",
                                format!("'{}' is not a single character", s),
                            ))
                        }
                    };
                }
                "separateinstances" => config.graphite.separate_instances = child.boolean()?,
                "alwaysappendds" => config.graphite.always_append_ds = child.boolean()?,
                "preserveseparator" => config.graphite.preserve_separator = child.boolean()?,
                "dropduplicatefields" => config.graphite.drop_duplicate_fields = child.boolean()?,
                "storerates" => config.store_rates = child.boolean()?,
                "buffersize" => config.buffer_size = child.count()? as usize,
                _ => warn!(
                    target: "collectd::write_log",
                    key = %child.key,
                    "Unknown option in the write_log block, ignored"
                ),
            }
        }
        Ok(config)
    }
}

// ============================================================================
// SECTION 2: WRITER
// ============================================================================

pub struct WriteLog {
    config: WriteLogConfig,
    graphite: GraphiteFormatter,
    registry: Weak<Registry>,
    buffer: Option<BufferedWriter<LogSink>>,
}

impl WriteLog {
    pub fn new(config: WriteLogConfig, registry: Weak<Registry>) -> Self {
        let buffer = (config.format == OutputFormat::Json && config.buffer_size > 0).then(|| {
            BufferedWriter::new(
                PLUGIN_NAME,
                LogSink::new(PLUGIN_NAME),
                BufferedWriterOptions {
                    buffer_size: config.buffer_size,
                    store_rates: config.store_rates,
                    ..BufferedWriterOptions::default()
                },
            )
        });
        Self {
            graphite: GraphiteFormatter::new(config.graphite.clone()),
            config,
            registry,
            buffer,
        }
    }

    pub fn config(&self) -> &WriteLogConfig {
        &self.config
    }

    fn rates(&self, vl: &ValueList) -> CollectdResult<Option<Vec<f64>>> {
        if !self.config.store_rates {
            return Ok(None);
        }
        match self.registry.upgrade() {
            Some(registry) => Ok(Some(registry.cache().get_rate(&vl.identifier)?.to_vec())),
            None => Ok(None),
        }
    }

    /// The log lines for one value list.
    pub fn render(&self, ds: &DataSet, vl: &ValueList, rates: Option<&[f64]>) -> CollectdResult<Vec<String>> {
        match self.config.format {
            OutputFormat::Graphite => Ok(self
                .graphite
                .format(ds, vl, rates)?
                .lines()
                .map(str::to_string)
                .collect()),
            OutputFormat::Json => Ok(vec![format!("[{}]", value_list_to_json(ds, vl, rates)?)]),
        }
    }

    /// Log one value list. Returns the number of lines logged, zero when
    /// the value list was skipped or buffered.
    pub fn write(&self, ds: &DataSet, vl: &ValueList) -> CollectdResult<usize> {
        if vl.is_aggregation_created() {
            return Ok(0);
        }
        let rates = self.rates(vl)?;
        if let Some(buffer) = &self.buffer {
            buffer.write(ds, vl, rates.as_deref())?;
            return Ok(0);
        }
        let lines = self.render(ds, vl, rates.as_deref())?;
        for line in &lines {
            info!(target: "collectd::write_log", "{}", line);
        }
        Ok(lines.len())
    }

    pub fn notify(&self, notification: &Notification) -> CollectdResult<()> {
        let alert = format_alert(notification)?;
        info!(target: "collectd::write_log", "{}", alert);
        Ok(())
    }

    pub fn flush(&self, timeout: CdTime) -> CollectdResult<usize> {
        match &self.buffer {
            Some(buffer) => buffer.flush(timeout),
            None => Ok(0),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.buffered())
    }

    pub fn register(self: Arc<Self>, registry: &Registry) -> CollectdResult<()> {
        let writer = Arc::clone(&self);
        registry.register_write(
            PLUGIN_NAME,
            Arc::new(move |ds: &DataSet, vl: &ValueList| writer.write(ds, vl).map(|_| ())),
        )?;
        let notifier = Arc::clone(&self);
        registry.register_notification(PLUGIN_NAME, Arc::new(move |n: &Notification| notifier.notify(n)))?;

        if self.buffer.is_some() {
            let flusher = Arc::clone(&self);
            registry.register_flush(
                PLUGIN_NAME,
                Arc::new(move |timeout: CdTime, _ident: Option<&Identifier>| flusher.flush(timeout).map(|_| ())),
            )?;
            let closer = Arc::clone(&self);
            registry.register_shutdown(
                PLUGIN_NAME,
                Arc::new(move || match &closer.buffer {
                    Some(buffer) => buffer.close(),
                    None => Ok(()),
                }),
            )?;
        }
        info!(target: "collectd::write_log", format = ?self.config.format, buffered = self.buffer.is_some(), "write_log registered");
        Ok(())
    }
}

pub struct WriteLogModule;

impl PluginModule for WriteLogModule {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn load(&self, registry: &Arc<Registry>, block: Option<&ConfigItem>, _load: &LoadPluginConfig) -> CollectdResult<()> {
        let config = match block {
            Some(block) => WriteLogConfig::from_item(block)?,
            None => WriteLogConfig::default(),
        };
        Arc::new(WriteLog::new(config, Arc::downgrade(registry))).register(registry)
    }
}

// ============================================================================
// SECTION 3: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigValue;
    use crate::meta::{MetaData, AGGREGATION_CREATED};
    use crate::plugin::GlobalSettings;
    use crate::types::Value;
    use pretty_assertions::assert_eq;

    fn option(key: &str, value: ConfigValue) -> ConfigItem {
        ConfigItem::new(key).with_value(value)
    }

    fn cpu() -> (DataSet, ValueList) {
        let ds = DataSet::parse_types_db_line("cpu value:DERIVE:0:U").unwrap().unwrap();
        let vl = ValueList::new(Identifier::new("h", "cpu", "0", "cpu", "user"), [Value::Derive(1200)])
            .with_time(CdTime::from_secs(1_700_000_000))
            .with_interval(CdTime::from_secs(10));
        (ds, vl)
    }

    #[test]
    fn test_config_block() {
        let block = ConfigItem::new("Plugin")
            .with_value(ConfigValue::String("write_log".into()))
            .with_child(option("Format", ConfigValue::String("JSON".into())))
            .with_child(option("EscapeCharacter", ConfigValue::String("-".into())))
            .with_child(option("StoreRates", ConfigValue::Boolean(true)))
            .with_child(option("BufferSize", ConfigValue::Number(8192.0)));
        let config = WriteLogConfig::from_item(&block).unwrap();
        assert_eq!(config.format, OutputFormat::Json);
        assert_eq!(config.graphite.escape_char, '-');
        assert!(config.store_rates);
        assert_eq!(config.buffer_size, 8192);

        let bad = ConfigItem::new("Plugin").with_child(option("Format", ConfigValue::String("xml".into())));
        assert!(WriteLogConfig::from_item(&bad).is_err());
        let bad = ConfigItem::new("Plugin").with_child(option("EscapeCharacter", ConfigValue::String("ab".into())));
        assert!(WriteLogConfig::from_item(&bad).is_err());
    }

    #[test]
    fn test_render_graphite_and_json() {
        let (ds, vl) = cpu();
        let graphite = WriteLog::new(WriteLogConfig::default(), Weak::new());
        assert_eq!(
            graphite.render(&ds, &vl, None).unwrap(),
            vec!["h.cpu-0.cpu-user 1200 1700000000".to_string()]
        );

        let json = WriteLog::new(
            WriteLogConfig {
                format: OutputFormat::Json,
                ..WriteLogConfig::default()
            },
            Weak::new(),
        );
        let lines = json.render(&ds, &vl, Some(&[2.5][..])).unwrap();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed.as_array().map(Vec::len), Some(1));
        assert_eq!(parsed[0]["values"], serde_json::json!([2.5]));
        assert!(lines[0].capacity() < 4096);
    }

    #[test]
    fn test_aggregated_lists_are_skipped() {
        let (ds, vl) = cpu();
        let meta = MetaData::new();
        meta.add_boolean(AGGREGATION_CREATED, true);
        let aggregated = vl.clone().with_meta(meta);

        let writer = WriteLog::new(WriteLogConfig::default(), Weak::new());
        assert_eq!(writer.write(&ds, &vl).unwrap(), 1);
        assert_eq!(writer.write(&ds, &aggregated).unwrap(), 0);
    }

    #[test]
    fn test_buffered_json_until_flush() {
        let registry = Arc::new(Registry::new(GlobalSettings::default()));
        let block = ConfigItem::new("Plugin")
            .with_child(option("Format", ConfigValue::String("json".into())))
            .with_child(option("BufferSize", ConfigValue::Number(4096.0)));
        let writer = Arc::new(WriteLog::new(
            WriteLogConfig::from_item(&block).unwrap(),
            Arc::downgrade(&registry),
        ));
        Arc::clone(&writer).register(&registry).unwrap();

        let (_, vl) = cpu();
        registry.dispatch_values(vl).unwrap();
        assert_eq!(writer.buffered(), 1);
        assert_eq!(registry.flush(CdTime::ZERO, Some(PLUGIN_NAME), None).unwrap(), 1);
        assert_eq!(writer.buffered(), 0);
    }

    #[test]
    fn test_module_registers_writer_and_notifier() {
        let registry = Arc::new(Registry::new(GlobalSettings::default()));
        WriteLogModule
            .load(&registry, None, &LoadPluginConfig::new(PLUGIN_NAME))
            .unwrap();
        assert_eq!(registry.write_names(), vec![PLUGIN_NAME.to_string()]);

        let n = Notification::new(
            crate::types::Severity::Warning,
            Identifier::new("h", "cpu", "", "cpu", ""),
            "hot",
        );
        registry.dispatch_notification(n).unwrap();
    }
}
