// ============================================================================
// SECTION 1: CONFIGURATION TREE
// ============================================================================
// The daemon reads a TOML document (plus COLLECTD_* environment overrides)
// and turns it into a tree of generic blocks. The core interprets a handful
// of top-level keys; everything under a `Plugin` block is handed to the
// plugin it names.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::logging::LoggingConfig;
use crate::plugin::{default_hostname, GlobalSettings};
use crate::time::CdTime;

/// Keys whose tables hold one labelled block per entry.
const LABELLED_KEYS: &[&str] = &["Plugin", "LoadPlugin"];

pub const DEFAULT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_TIMEOUT_FACTOR: u64 = 2;
pub const DEFAULT_READ_THREADS: usize = 5;

// ----------------------------------------------------------------------------
// 1.1 Values and Blocks
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    String(String),
    Number(f64),
    Boolean(bool),
}

impl Display for ConfigValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::String(s) => write!(f, "\"{}\"", s),
            ConfigValue::Number(n) => write!(f, "{}", n),
            ConfigValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// One block of the configuration tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigItem {
    pub key: String,
    pub values: Vec<ConfigValue>,
    pub children: Vec<ConfigItem>,
}

impl ConfigItem {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: ConfigValue) -> Self {
        self.values.push(value);
        self
    }

    pub fn with_child(mut self, child: ConfigItem) -> Self {
        self.children.push(child);
        self
    }

    /// Keys compare case-insensitively.
    pub fn key_is(&self, key: &str) -> bool {
        self.key.eq_ignore_ascii_case(key)
    }

    pub fn child(&self, key: &str) -> Option<&ConfigItem> {
        self.children.iter().rev().find(|c| c.key_is(key))
    }

    pub fn children_named<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a ConfigItem> + 'a {
        self.children.iter().filter(move |c| c.key_is(key))
    }

    fn single(&self) -> ConfigResult<&ConfigValue> {
        match self.values.as_slice() {
            [value] => Ok(value),
            _ => Err(ConfigError::invalid_value(
                &self.key,
                format!("expected exactly one value, got {}", self.values.len()),
            )),
        }
    }

    pub fn string(&self) -> ConfigResult<&str> {
        match self.single()? {
            ConfigValue::String(s) => Ok(s),
            other => Err(ConfigError::invalid_value(&self.key, format!("expected a string, got {}", other))),
        }
    }

    pub fn boolean(&self) -> ConfigResult<bool> {
        match self.single()? {
            ConfigValue::Boolean(b) => Ok(*b),
            ConfigValue::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            ConfigValue::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            other => Err(ConfigError::invalid_value(&self.key, format!("expected a boolean, got {}", other))),
        }
    }

    pub fn number(&self) -> ConfigResult<f64> {
        match self.single()? {
            ConfigValue::Number(n) => Ok(*n),
            ConfigValue::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ConfigError::invalid_value(&self.key, format!("'{}' is not a number", s))),
            other => Err(ConfigError::invalid_value(&self.key, format!("expected a number, got {}", other))),
        }
    }

    /// A non-negative integer.
    pub fn count(&self) -> ConfigResult<u64> {
        let n = self.number()?;
        if n < 0.0 || n.fract() != 0.0 || !n.is_finite() {
            return Err(ConfigError::invalid_value(&self.key, format!("{} is not a non-negative integer", n)));
        }
        Ok(n as u64)
    }

    /// A positive time span: seconds as a number or a humantime string.
    pub fn duration(&self) -> ConfigResult<CdTime> {
        let span = match self.single()? {
            ConfigValue::Number(secs) => {
                if !secs.is_finite() || *secs <= 0.0 {
                    return Err(ConfigError::invalid_value(&self.key, format!("{} is not a positive time span", secs)));
                }
                CdTime::from_secs_f64(*secs)
            }
            ConfigValue::String(s) => match s.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs > 0.0 => CdTime::from_secs_f64(secs),
                Ok(secs) => {
                    return Err(ConfigError::invalid_value(&self.key, format!("{} is not a positive time span", secs)))
                }
                Err(_) => humantime::parse_duration(s)
                    .map(CdTime::from_duration)
                    .map_err(|e| ConfigError::invalid_value(&self.key, format!("'{}': {}", s, e)))?,
            },
            other => return Err(ConfigError::invalid_value(&self.key, format!("expected a time span, got {}", other))),
        };
        if span.is_zero() {
            return Err(ConfigError::invalid_value(&self.key, "time span must be positive"));
        }
        Ok(span)
    }
}

// ----------------------------------------------------------------------------
// 1.2 Document Conversion
// ----------------------------------------------------------------------------

fn scalar(key: &str, value: &JsonValue) -> ConfigResult<Option<ConfigValue>> {
    Ok(match value {
        JsonValue::String(s) => Some(ConfigValue::String(s.clone())),
        JsonValue::Bool(b) => Some(ConfigValue::Boolean(*b)),
        JsonValue::Number(n) => Some(ConfigValue::Number(
            n.as_f64()
                .ok_or_else(|| ConfigError::invalid_value(key, format!("{} does not fit a float", n)))?,
        )),
        _ => None,
    })
}

fn convert_entry(key: &str, value: &JsonValue, out: &mut Vec<ConfigItem>) -> ConfigResult<()> {
    if let Some(v) = scalar(key, value)? {
        out.push(ConfigItem::new(key).with_value(v));
        return Ok(());
    }
    match value {
        JsonValue::Null => out.push(ConfigItem::new(key)),
        JsonValue::Array(elements) => {
            if elements.iter().all(JsonValue::is_object) && !elements.is_empty() {
                for element in elements {
                    let mut item = ConfigItem::new(key);
                    if let JsonValue::Object(table) = element {
                        item.children = convert_table(table)?;
                    }
                    out.push(item);
                }
            } else {
                let mut item = ConfigItem::new(key);
                for element in elements {
                    let v = scalar(key, element)?
                        .ok_or_else(|| ConfigError::invalid_value(key, "arrays must hold only scalars or only tables"))?;
                    item.values.push(v);
                }
                out.push(item);
            }
        }
        JsonValue::Object(table) if LABELLED_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key)) => {
            for (label, body) in table {
                let bodies: Vec<&JsonValue> = match body {
                    JsonValue::Array(elements) if elements.iter().all(JsonValue::is_object) => elements.iter().collect(),
                    _ => vec![body],
                };
                for body in bodies {
                    let mut item = ConfigItem::new(key).with_value(ConfigValue::String(label.clone()));
                    if let JsonValue::Object(inner) = body {
                        item.children = convert_table(inner)?;
                    }
                    out.push(item);
                }
            }
        }
        JsonValue::Object(table) => {
            let mut item = ConfigItem::new(key);
            item.children = convert_table(table)?;
            out.push(item);
        }
        _ => {}
    }
    Ok(())
}

fn convert_table(table: &Map<String, JsonValue>) -> ConfigResult<Vec<ConfigItem>> {
    let mut items = Vec::with_capacity(table.len());
    for (key, value) in table {
        convert_entry(key, value, &mut items)?;
    }
    Ok(items)
}

/// Convert a loaded document into top-level blocks.
pub fn tree_from_document(doc: &JsonValue) -> ConfigResult<Vec<ConfigItem>> {
    match doc {
        JsonValue::Object(table) => convert_table(table),
        JsonValue::Null => Ok(Vec::new()),
        _ => Err(ConfigError::parse("the configuration root must be a table")),
    }
}

fn extract(figment: Figment) -> ConfigResult<Vec<ConfigItem>> {
    let doc: JsonValue = figment.extract().map_err(|e| ConfigError::parse(e.to_string()))?;
    tree_from_document(&doc)
}

// ============================================================================
// SECTION 2: DAEMON CONFIGURATION
// ============================================================================

/// A `LoadPlugin` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadPluginConfig {
    pub name: String,
    /// Accepted for compatibility; modules are linked in
    pub globals: bool,
    /// Overrides the global interval for this plugin's reads
    pub interval: Option<CdTime>,
}

impl LoadPluginConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            globals: false,
            interval: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Global read interval
    pub interval: CdTime,
    /// Intervals without an update before an entry counts as missing
    pub timeout_factor: u64,
    /// Concurrent read callbacks
    pub read_threads: usize,
    /// Defaults to the operating system's host name
    pub hostname: Option<String>,
    pub types_db: Vec<PathBuf>,
    pub logging: LoggingConfig,
    pub load_plugins: Vec<LoadPluginConfig>,
    /// `Plugin` blocks; the first value of each is the plugin name
    pub plugin_blocks: Vec<ConfigItem>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: CdTime::from_secs(DEFAULT_INTERVAL_SECS),
            timeout_factor: DEFAULT_TIMEOUT_FACTOR,
            read_threads: DEFAULT_READ_THREADS,
            hostname: None,
            types_db: Vec::new(),
            logging: LoggingConfig::default(),
            load_plugins: Vec::new(),
            plugin_blocks: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Load a TOML file with `COLLECTD_*` environment overrides
    /// (`COLLECTD_LOGGING__LEVEL=debug` sets `Logging.Level`).
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        // Env keys arrive lowercased and sort after the capitalized file
        // keys, so they are applied last.
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("COLLECTD_").ignore(&["config"]).split("__"));
        let config = Self::from_tree(&extract(figment)?)?;
        config.validate()?;
        debug!(target: "collectd::config", path = %path.display(), plugins = config.load_plugins.len(), "Configuration loaded");
        Ok(config)
    }

    /// Parse a TOML document without environment overrides.
    pub fn from_toml_str(toml_str: &str) -> ConfigResult<Self> {
        let config = Self::from_tree(&extract(Figment::new().merge(Toml::string(toml_str)))?)?;
        config.validate()?;
        Ok(config)
    }

    /// Interpret the top-level blocks.
    pub fn from_tree(items: &[ConfigItem]) -> ConfigResult<Self> {
        let mut config = Self::default();
        for item in items {
            match item.key.to_ascii_lowercase().as_str() {
                "interval" => config.interval = item.duration()?,
                "timeout" => {
                    let factor = item.count()?;
                    if factor < 1 {
                        return Err(ConfigError::invalid_value("Timeout", "the timeout factor must be at least 1"));
                    }
                    config.timeout_factor = factor;
                }
                "readthreads" => config.read_threads = item.count()? as usize,
                "hostname" => config.hostname = Some(item.string()?.to_string()),
                "typesdb" => {
                    for value in &item.values {
                        match value {
                            ConfigValue::String(path) => config.types_db.push(PathBuf::from(path)),
                            other => {
                                return Err(ConfigError::invalid_value("TypesDB", format!("expected a path, got {}", other)))
                            }
                        }
                    }
                }
                "logging" => config.logging = logging_from_item(item)?,
                "loadplugin" => config.add_load_plugin(item)?,
                "plugin" => {
                    item.values
                        .first()
                        .and_then(|v| match v {
                            ConfigValue::String(s) if !s.is_empty() => Some(s),
                            _ => None,
                        })
                        .ok_or_else(|| ConfigError::missing_field("Plugin name"))?;
                    config.plugin_blocks.push(item.clone());
                }
                _ => warn!(target: "collectd::config", key = %item.key, "Ignoring unknown configuration option"),
            }
        }
        Ok(config)
    }

    fn add_load_plugin(&mut self, item: &ConfigItem) -> ConfigResult<()> {
        if item.values.is_empty() {
            return Err(ConfigError::missing_field("LoadPlugin name"));
        }
        // `LoadPlugin = ["a", "b"]` lists names; a labelled block has one
        // name and optional options.
        for value in &item.values {
            let ConfigValue::String(name) = value else {
                return Err(ConfigError::invalid_value("LoadPlugin", format!("expected a name, got {}", value)));
            };
            let mut entry = LoadPluginConfig::new(name.as_str());
            for child in &item.children {
                match child.key.to_ascii_lowercase().as_str() {
                    "globals" => entry.globals = child.boolean()?,
                    "interval" => entry.interval = Some(child.duration()?),
                    _ => warn!(target: "collectd::config", plugin = %name, key = %child.key, "Ignoring unknown LoadPlugin option"),
                }
            }
            self.load_plugins.retain(|p| p.name != entry.name);
            self.load_plugins.push(entry);
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid_value("Interval", "must be positive"));
        }
        if self.timeout_factor < 1 {
            return Err(ConfigError::invalid_value("Timeout", "the timeout factor must be at least 1"));
        }
        if self.read_threads == 0 {
            return Err(ConfigError::invalid_value("ReadThreads", "at least one read thread is required"));
        }
        self.logging.validate()?;
        for block in &self.plugin_blocks {
            let name = plugin_block_name(block).unwrap_or_default();
            if !self.is_loaded(name) {
                return Err(ConfigError::ValidationFailed {
                    message: format!("there is a Plugin block for '{}' but the plugin is not loaded", name),
                });
            }
        }
        Ok(())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.load_plugins.iter().any(|p| p.name == name)
    }

    /// The `Plugin` block for `name`, if any.
    pub fn plugin_block(&self, name: &str) -> Option<&ConfigItem> {
        self.plugin_blocks
            .iter()
            .rev()
            .find(|b| plugin_block_name(b) == Some(name))
    }

    /// The global settings this configuration describes.
    pub fn settings(&self) -> GlobalSettings {
        GlobalSettings {
            hostname: self.hostname.clone().unwrap_or_else(default_hostname),
            interval: self.interval,
            timeout_factor: self.timeout_factor,
        }
    }

    /// A commented default configuration file.
    pub fn generate_default() -> String {
        let mut doc = toml::Table::new();
        doc.insert("Interval".into(), toml::Value::String(format!("{}s", DEFAULT_INTERVAL_SECS)));
        doc.insert("Timeout".into(), toml::Value::Integer(DEFAULT_TIMEOUT_FACTOR as i64));
        doc.insert("ReadThreads".into(), toml::Value::Integer(DEFAULT_READ_THREADS as i64));
        doc.insert(
            "LoadPlugin".into(),
            toml::Value::Array(vec!["aggregation".into(), "write_log".into()]),
        );

        let logging = LoggingConfig::default();
        let mut logging_table = toml::Table::new();
        logging_table.insert("Level".into(), logging.level.into());
        logging_table.insert("Format".into(), logging.format.into());
        logging_table.insert("Colors".into(), logging.colors.into());
        doc.insert("Logging".into(), toml::Value::Table(logging_table));

        let mut aggregation = toml::Table::new();
        aggregation.insert("Plugin".into(), "cpu".into());
        aggregation.insert("Type".into(), "cpu".into());
        aggregation.insert("GroupBy".into(), toml::Value::Array(vec!["Host".into(), "TypeInstance".into()]));
        aggregation.insert("CalculateSum".into(), true.into());
        aggregation.insert("CalculateAverage".into(), true.into());
        let mut aggregation_plugin = toml::Table::new();
        aggregation_plugin.insert(
            "Aggregation".into(),
            toml::Value::Array(vec![toml::Value::Table(aggregation)]),
        );

        let mut write_log = toml::Table::new();
        write_log.insert("Format".into(), "graphite".into());

        let mut plugins = toml::Table::new();
        plugins.insert("aggregation".into(), toml::Value::Table(aggregation_plugin));
        plugins.insert("write_log".into(), toml::Value::Table(write_log));
        doc.insert("Plugin".into(), toml::Value::Table(plugins));

        let body = toml::to_string_pretty(&doc).unwrap_or_default();
        format!(
            "# collectd configuration\n\
             #\n\
             # Time spans take seconds (10, 0.5) or humantime strings (\"10s\", \"1m 30s\").\n\
             # Every key can be overridden from the environment, e.g.\n\
             # COLLECTD_INTERVAL=5 or COLLECTD_LOGGING__LEVEL=debug.\n\
             # Hostname = \"myhost\"\n\
             # TypesDB = [\"/usr/share/collectd/types.db\"]\n\n{}",
            body
        )
    }
}

/// The plugin a `Plugin` block belongs to.
pub fn plugin_block_name(block: &ConfigItem) -> Option<&str> {
    match block.values.first() {
        Some(ConfigValue::String(name)) => Some(name.as_str()),
        _ => None,
    }
}

fn logging_from_item(item: &ConfigItem) -> ConfigResult<LoggingConfig> {
    let mut logging = LoggingConfig::default();
    for child in &item.children {
        match child.key.to_ascii_lowercase().as_str() {
            "level" => logging.level = child.string()?.to_string(),
            "format" => logging.format = child.string()?.to_ascii_lowercase(),
            "file" => logging.file = Some(PathBuf::from(child.string()?)),
            "colors" => logging.colors = child.boolean()?,
            "sourcelocation" | "source_location" => logging.source_location = child.boolean()?,
            _ => warn!(target: "collectd::config", key = %child.key, "Ignoring unknown Logging option"),
        }
    }
    Ok(logging)
}

// ============================================================================
// SECTION 3: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use test_case::test_case;

    const SAMPLE: &str = r#"
Interval = "5s"
Timeout = 3
ReadThreads = 2
Hostname = "web01"

[LoadPlugin.write_log]

[LoadPlugin.aggregation]
Interval = 30

[Logging]
Level = "debug"
Format = "json"

[Plugin.aggregation]
[[Plugin.aggregation.Aggregation]]
Plugin = "cpu"
Type = "cpu"
GroupBy = ["Host"]
CalculateSum = true

[[Plugin.aggregation.Aggregation]]
Plugin = "memory"
Type = "memory"
CalculateAverage = true
"#;

    #[test]
    fn test_sample_document() {
        let config = DaemonConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.interval, CdTime::from_secs(5));
        assert_eq!(config.timeout_factor, 3);
        assert_eq!(config.read_threads, 2);
        assert_eq!(config.hostname.as_deref(), Some("web01"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");

        let aggregation = config
            .load_plugins
            .iter()
            .find(|p| p.name == "aggregation")
            .unwrap();
        assert_eq!(aggregation.interval, Some(CdTime::from_secs(30)));
        assert!(config.is_loaded("write_log"));

        let block = config.plugin_block("aggregation").unwrap();
        let aggregations: Vec<_> = block.children_named("Aggregation").collect();
        assert_eq!(aggregations.len(), 2);
        let group_by = aggregations[0].child("GroupBy").unwrap();
        assert_eq!(group_by.values, vec![ConfigValue::String("Host".into())]);
        assert!(aggregations[1].child("calculateaverage").unwrap().boolean().unwrap());
    }

    #[test]
    fn test_labelled_tables_become_blocks() {
        let doc = serde_json::json!({
            "Plugin": { "write_log": { "Format": "json" } },
            "ReadThreads": 4,
        });
        let tree = tree_from_document(&doc).unwrap();
        let plugin = tree.iter().find(|i| i.key == "Plugin").unwrap();
        assert_eq!(plugin.values, vec![ConfigValue::String("write_log".into())]);
        assert_eq!(plugin.child("Format").unwrap().string().unwrap(), "json");
        let threads = tree.iter().find(|i| i.key == "ReadThreads").unwrap();
        assert_eq!(threads.count().unwrap(), 4);
    }

    #[test_case(serde_json::json!(10), 10_000 ; "number of seconds")]
    #[test_case(serde_json::json!(0.5), 500 ; "fractional seconds")]
    #[test_case(serde_json::json!("1m 30s"), 90_000 ; "humantime")]
    #[test_case(serde_json::json!("2.5"), 2_500 ; "numeric string")]
    fn test_durations(value: JsonValue, millis: u64) {
        let mut items = Vec::new();
        convert_entry("Interval", &value, &mut items).unwrap();
        assert_eq!(items[0].duration().unwrap(), CdTime::from_millis(millis));
    }

    #[test_case("Interval = 0" ; "zero interval")]
    #[test_case("Interval = -5" ; "negative interval")]
    #[test_case("Timeout = 0" ; "timeout factor below one")]
    #[test_case("ReadThreads = 0" ; "no read threads")]
    #[test_case("Interval = \"soon\"" ; "unparseable span")]
    fn test_rejected_values(doc: &str) {
        assert!(DaemonConfig::from_toml_str(doc).is_err());
    }

    #[test]
    fn test_plugin_block_requires_load() {
        let doc = "[Plugin.write_log]\nFormat = \"json\"\n";
        let err = DaemonConfig::from_toml_str(doc).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed { .. }));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let config = DaemonConfig::from_toml_str("FQDNLookup = true\nReadThreads = 3\n").unwrap();
        assert_eq!(config.read_threads, 3);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.read_threads, 2);
        assert_eq!(config.settings().hostname, "web01");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_generated_default_parses() {
        let text = DaemonConfig::generate_default();
        assert!(text.starts_with("# collectd configuration"));
        let config = DaemonConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.interval, CdTime::from_secs(DEFAULT_INTERVAL_SECS));
        assert_eq!(config.read_threads, DEFAULT_READ_THREADS);
        assert!(config.plugin_block("aggregation").is_some());
        assert!(config.plugin_block("write_log").is_some());
    }
}
