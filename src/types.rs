//! Typed data model: data sources, data sets, values, value lists and
//! notifications, plus the value-kind arithmetic shared by the cache and the
//! aggregator.

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use compact_str::CompactString;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::error::{CollectdError, CollectdResult, ConfigError};
use crate::identifier::Identifier;
use crate::meta::{MetaData, MetaEntry, MetaValue};
use crate::time::CdTime;

// ============================================================================
// SECTION 1: DATA SOURCES & DATA SETS
// ============================================================================

// ----------------------------------------------------------------------------
// 1.1 Data Source Kinds
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DsType {
    Gauge,
    Counter,
    Derive,
    Absolute,
}

impl DsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DsType::Gauge => "gauge",
            DsType::Counter => "counter",
            DsType::Derive => "derive",
            DsType::Absolute => "absolute",
        }
    }
}

impl Display for DsType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DsType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GAUGE" => Ok(DsType::Gauge),
            "COUNTER" => Ok(DsType::Counter),
            "DERIVE" => Ok(DsType::Derive),
            "ABSOLUTE" => Ok(DsType::Absolute),
            _ => Err(ConfigError::invalid_value("ds_type", format!("unknown data source type '{}'", s))),
        }
    }
}

// ----------------------------------------------------------------------------
// 1.2 Data Source
// ----------------------------------------------------------------------------

/// One column of a data set. `min`/`max` are NaN when unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: CompactString,
    pub ds_type: DsType,
    pub min: f64,
    pub max: f64,
}

impl DataSource {
    pub fn new(name: impl Into<CompactString>, ds_type: DsType, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            ds_type,
            min,
            max,
        }
    }

    /// An unbounded source.
    pub fn unbounded(name: impl Into<CompactString>, ds_type: DsType) -> Self {
        Self::new(name, ds_type, f64::NAN, f64::NAN)
    }

    /// Replace an out-of-range rate with NaN. NaN bounds do not constrain.
    pub fn range_check(&self, rate: f64) -> f64 {
        if (!self.min.is_nan() && rate < self.min) || (!self.max.is_nan() && rate > self.max) {
            f64::NAN
        } else {
            rate
        }
    }
}

// ----------------------------------------------------------------------------
// 1.3 Data Set
// ----------------------------------------------------------------------------

/// The schema of a `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSet {
    pub type_name: CompactString,
    pub sources: Vec<DataSource>,
}

impl DataSet {
    pub fn new(type_name: impl Into<CompactString>, sources: Vec<DataSource>) -> Self {
        Self {
            type_name: type_name.into(),
            sources,
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn ds_types(&self) -> Vec<DsType> {
        self.sources.iter().map(|s| s.ds_type).collect()
    }

    /// Verify that a value list matches this schema in type, arity and kinds.
    pub fn check(&self, vl: &ValueList) -> CollectdResult<()> {
        if vl.identifier.type_name != self.type_name {
            return Err(CollectdError::invariant(format!(
                "value list type '{}' does not match data set '{}'",
                vl.identifier.type_name, self.type_name
            )));
        }
        if vl.values.len() != self.sources.len() {
            return Err(CollectdError::invariant(format!(
                "{}: {} values for data set '{}' with {} sources",
                vl.identifier,
                vl.values.len(),
                self.type_name,
                self.sources.len()
            )));
        }
        for (value, source) in vl.values.iter().zip(&self.sources) {
            if value.ds_type() != source.ds_type {
                return Err(CollectdError::invariant(format!(
                    "{}: data source '{}' is {} but value is {}",
                    vl.identifier,
                    source.name,
                    source.ds_type,
                    value.ds_type()
                )));
            }
        }
        Ok(())
    }

    /// Parse one types database line, e.g.
    /// `if_octets rx:DERIVE:0:U, tx:DERIVE:0:U`.
    pub fn parse_types_db_line(line: &str) -> Result<Option<DataSet>, ConfigError> {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (name, rest) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| ConfigError::parse(format!("types database line without sources: '{}'", line)))?;

        let mut sources = Vec::new();
        for source in rest.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let parts: Vec<&str> = source.split(':').collect();
            if parts.len() != 4 {
                return Err(ConfigError::parse(format!(
                    "data source '{}' of type '{}' must have the form name:TYPE:min:max",
                    source, name
                )));
            }
            let ds_type: DsType = parts[1].parse()?;
            sources.push(DataSource::new(
                parts[0],
                ds_type,
                parse_bound(parts[2])?,
                parse_bound(parts[3])?,
            ));
        }
        if sources.is_empty() {
            return Err(ConfigError::parse(format!("type '{}' has no data sources", name)));
        }
        Ok(Some(DataSet::new(name, sources)))
    }
}

/// Renders in types database syntax.
impl Display for DataSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name)?;
        for (i, source) in self.sources.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(
                f,
                "{}{}:{}:{}:{}",
                sep,
                source.name,
                source.ds_type.as_str().to_ascii_uppercase(),
                format_bound(source.min),
                format_bound(source.max)
            )?;
        }
        Ok(())
    }
}

fn format_bound(v: f64) -> String {
    if v.is_nan() {
        "U".to_string()
    } else {
        v.to_string()
    }
}

fn parse_bound(s: &str) -> Result<f64, ConfigError> {
    if s.eq_ignore_ascii_case("U") {
        return Ok(f64::NAN);
    }
    s.parse::<f64>()
        .map_err(|e| ConfigError::parse(format!("invalid bound '{}': {}", s, e)))
}

// ============================================================================
// SECTION 2: VALUES & VALUE LISTS
// ============================================================================

/// A single raw value; the tag matches the owning data source's kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Gauge(f64),
    Counter(u64),
    Derive(i64),
    Absolute(u64),
}

impl Value {
    pub fn ds_type(&self) -> DsType {
        match self {
            Value::Gauge(_) => DsType::Gauge,
            Value::Counter(_) => DsType::Counter,
            Value::Derive(_) => DsType::Derive,
            Value::Absolute(_) => DsType::Absolute,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Gauge(v) => v,
            Value::Counter(v) => v as f64,
            Value::Derive(v) => v as f64,
            Value::Absolute(v) => v as f64,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Gauge(v) if v.is_nan() => f.write_str("nan"),
            Value::Gauge(v) => write!(f, "{}", v),
            Value::Counter(v) | Value::Absolute(v) => write!(f, "{}", v),
            Value::Derive(v) => write!(f, "{}", v),
        }
    }
}

pub type Values = SmallVec<[Value; 4]>;

/// One sample bundle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueList {
    pub identifier: Identifier,
    pub time: CdTime,
    pub interval: CdTime,
    pub values: Values,
    pub meta: Option<MetaData>,
}

impl ValueList {
    pub fn new(identifier: Identifier, values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            identifier,
            time: CdTime::ZERO,
            interval: CdTime::ZERO,
            values: values.into_iter().collect(),
            meta: None,
        }
    }

    pub fn with_time(mut self, time: CdTime) -> Self {
        self.time = time;
        self
    }

    pub fn with_interval(mut self, interval: CdTime) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_meta(mut self, meta: MetaData) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Metadata, created on first use.
    pub fn meta_mut(&mut self) -> &mut MetaData {
        self.meta.get_or_insert_with(MetaData::new)
    }

    /// True when a re-injecting writer produced this value list.
    pub fn is_aggregation_created(&self) -> bool {
        self.meta
            .as_ref()
            .map(MetaData::is_aggregation_created)
            .unwrap_or(false)
    }
}

// ============================================================================
// SECTION 3: NOTIFICATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Failure = 1,
    Warning = 2,
    Okay = 4,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Failure => "FAILURE",
            Severity::Warning => "WARNING",
            Severity::Okay => "OKAY",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "failure" => Ok(Severity::Failure),
            "warning" => Ok(Severity::Warning),
            "okay" => Ok(Severity::Okay),
            _ => Err(ConfigError::invalid_value("severity", format!("unknown severity '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub severity: Severity,
    pub time: CdTime,
    pub identifier: Identifier,
    pub message: String,
    pub meta: Vec<MetaEntry>,
}

impl Notification {
    pub fn new(severity: Severity, identifier: Identifier, message: impl Into<String>) -> Self {
        Self {
            severity,
            time: CdTime::ZERO,
            identifier,
            message: message.into(),
            meta: Vec::new(),
        }
    }

    pub fn with_time(mut self, time: CdTime) -> Self {
        self.time = time;
        self
    }

    pub fn add_meta(&mut self, key: impl Into<String>, value: MetaValue) -> &mut Self {
        self.meta.push(MetaEntry::new(key, value));
        self
    }

    pub fn add_meta_string(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.add_meta(key, MetaValue::String(value.into()))
    }

    pub fn add_meta_double(&mut self, key: impl Into<String>, value: f64) -> &mut Self {
        self.add_meta(key, MetaValue::Double(value))
    }
}

// ============================================================================
// SECTION 4: VALUE-KIND ARITHMETIC
// ============================================================================

/// Difference of two counter readings, accounting for a single wrap. The
/// wrap width is 32 bits when the old value fits, 64 bits otherwise.
pub fn counter_diff(old: u64, new: u64) -> u64 {
    if new >= old {
        new - old
    } else if old <= u32::MAX as u64 {
        (u32::MAX as u64 - old) + new
    } else {
        (u64::MAX - old) + new
    }
}

/// Per-second rate between two raw values of the same kind. NaN when
/// `delta_secs` is not positive or the kinds disagree.
pub fn rate_between(old: &Value, new: &Value, delta_secs: f64) -> f64 {
    if !(delta_secs > 0.0) {
        return f64::NAN;
    }
    match (old, new) {
        (_, Value::Gauge(v)) => *v,
        (Value::Counter(o), Value::Counter(n)) => counter_diff(*o, *n) as f64 / delta_secs,
        (Value::Derive(o), Value::Derive(n)) => n.wrapping_sub(*o) as f64 / delta_secs,
        (Value::Absolute(_), Value::Absolute(n)) => *n as f64 / delta_secs,
        _ => f64::NAN,
    }
}

// ----------------------------------------------------------------------------
// 4.1 Rate to Value
// ----------------------------------------------------------------------------

/// State for turning a stream of rates back into raw values of a given kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateToValueState {
    last_value: Value,
    last_time: CdTime,
    residual: f64,
}

impl Default for RateToValueState {
    fn default() -> Self {
        Self {
            last_value: Value::Gauge(0.0),
            last_time: CdTime::ZERO,
            residual: 0.0,
        }
    }
}

impl RateToValueState {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Convert `rate` at time `t` into a raw value of kind `ds_type`.
///
/// Returns `Ok(None)` while the state is being initialised, which happens on
/// the first call for the integrating kinds and after every reset.
pub fn rate_to_value(
    rate: f64,
    state: &mut RateToValueState,
    ds_type: DsType,
    t: CdTime,
) -> CollectdResult<Option<Value>> {
    if ds_type == DsType::Gauge {
        state.last_value = Value::Gauge(rate);
        state.last_time = t;
        return Ok(Some(state.last_value));
    }

    if rate < 0.0 && matches!(ds_type, DsType::Counter | DsType::Absolute) {
        state.reset();
        return Err(CollectdError::invariant(format!(
            "negative rate {} cannot be expressed as {}",
            rate, ds_type
        )));
    }

    if t <= state.last_time {
        state.reset();
        return Err(CollectdError::invariant("rate_to_value: time is not increasing"));
    }

    let delta_t = (t - state.last_time).as_secs_f64();
    let delta_gauge = rate * delta_t + state.residual;

    if state.last_time.is_zero() {
        let (value, residual) = match ds_type {
            DsType::Derive => {
                let v = rate as i64;
                (Value::Derive(v), rate - v as f64)
            }
            DsType::Counter => {
                let v = rate as u64;
                (Value::Counter(v), rate - v as f64)
            }
            _ => {
                let v = rate as u64;
                (Value::Absolute(v), rate - v as f64)
            }
        };
        state.last_value = value;
        state.residual = residual;
        state.last_time = t;
        return Ok(None);
    }

    let (value, residual) = match (ds_type, state.last_value) {
        (DsType::Derive, Value::Derive(last)) => {
            let delta = delta_gauge as i64;
            (Value::Derive(last.wrapping_add(delta)), delta_gauge - delta as f64)
        }
        (DsType::Counter, Value::Counter(last)) => {
            let delta = delta_gauge as u64;
            (Value::Counter(last.wrapping_add(delta)), delta_gauge - delta as f64)
        }
        (DsType::Absolute, _) => {
            let delta = delta_gauge as u64;
            (Value::Absolute(delta), delta_gauge - delta as f64)
        }
        _ => {
            state.reset();
            return Err(CollectdError::invariant("rate_to_value: kind changed between calls"));
        }
    };

    state.last_value = value;
    state.residual = residual;
    state.last_time = t;
    Ok(Some(value))
}

// ============================================================================
// SECTION 5: DATA SET REGISTRY
// ============================================================================

static BUILTIN_TYPES: Lazy<Vec<DataSet>> = Lazy::new(|| {
    const LINES: &[&str] = &[
        "absolute value:ABSOLUTE:0:U",
        "bytes value:GAUGE:0:U",
        "counter value:COUNTER:U:U",
        "cpu value:DERIVE:0:U",
        "derive value:DERIVE:U:U",
        "gauge value:GAUGE:U:U",
        "if_errors rx:DERIVE:0:U, tx:DERIVE:0:U",
        "if_octets rx:DERIVE:0:U, tx:DERIVE:0:U",
        "if_packets rx:DERIVE:0:U, tx:DERIVE:0:U",
        "load shortterm:GAUGE:0:5000, midterm:GAUGE:0:5000, longterm:GAUGE:0:5000",
        "memory value:GAUGE:0:281474976710656",
        "percent value:GAUGE:0:100.1",
        "pressure value:GAUGE:0:U",
        "temperature value:GAUGE:U:U",
        "uptime value:GAUGE:0:U",
    ];
    LINES
        .iter()
        .filter_map(|line| DataSet::parse_types_db_line(line).ok().flatten())
        .collect()
});

/// Process-wide table of data sets, keyed by type name.
#[derive(Debug, Default)]
pub struct DataSetRegistry {
    sets: DashMap<CompactString, Arc<DataSet>>,
}

impl DataSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with the built-in types.
    pub fn with_builtin_types() -> Self {
        let registry = Self::new();
        for ds in BUILTIN_TYPES.iter() {
            registry.register(ds.clone());
        }
        registry
    }

    /// Register a data set, replacing an existing one of the same name.
    pub fn register(&self, ds: DataSet) {
        let name = ds.type_name.clone();
        if self.sets.insert(name.clone(), Arc::new(ds)).is_some() {
            info!(target: "collectd::types", type_name = %name, "Data set replaced");
        }
    }

    pub fn unregister(&self, type_name: &str) -> CollectdResult<()> {
        self.sets
            .remove(type_name)
            .map(|_| ())
            .ok_or_else(|| CollectdError::not_found(format!("data set '{}'", type_name)))
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<DataSet>> {
        self.sets.get(type_name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// All data sets sorted by name.
    pub fn all(&self) -> Vec<Arc<DataSet>> {
        let mut sets: Vec<Arc<DataSet>> = self.sets.iter().map(|e| Arc::clone(e.value())).collect();
        sets.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        sets
    }

    /// Load a types database file; returns the number of data sets read.
    pub fn load_types_db(&self, path: &Path) -> CollectdResult<usize> {
        let content = fs::read_to_string(path)?;
        let mut count = 0;
        for (lineno, line) in content.lines().enumerate() {
            let parsed = DataSet::parse_types_db_line(line).map_err(|e| {
                ConfigError::parse(format!("{}:{}: {}", path.display(), lineno + 1, e))
            })?;
            if let Some(ds) = parsed {
                self.register(ds);
                count += 1;
            }
        }
        debug!(target: "collectd::types", path = %path.display(), count, "Types database loaded");
        Ok(count)
    }
}

// ============================================================================
// SECTION 6: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use test_case::test_case;

    fn if_octets() -> DataSet {
        DataSet::new(
            "if_octets",
            vec![
                DataSource::unbounded("rx", DsType::Counter),
                DataSource::unbounded("tx", DsType::Counter),
            ],
        )
    }

    #[test_case(10, 25, 15 ; "no wrap")]
    #[test_case(4_294_967_290, 4, 9 ; "32 bit wrap")]
    // Wrap is `(MAX - old) + new` without the extra step, so a counter
    // leaving MAX for zero reads as no change.
    #[test_case(0xFFFF_FFFF, 0, 0 ; "32 bit wrap from max counts no step")]
    #[test_case(u64::MAX - 5, 4, 9 ; "64 bit wrap")]
    fn test_counter_diff(old: u64, new: u64, expected: u64) {
        assert_eq!(counter_diff(old, new), expected);
    }

    #[test]
    fn test_rate_between_kinds() {
        assert_eq!(rate_between(&Value::Derive(100), &Value::Derive(60), 10.0), -4.0);
        assert_eq!(rate_between(&Value::Absolute(0), &Value::Absolute(50), 10.0), 5.0);
        assert_eq!(rate_between(&Value::Gauge(1.0), &Value::Gauge(7.5), 10.0), 7.5);
        assert!(rate_between(&Value::Counter(1), &Value::Counter(2), 0.0).is_nan());
        assert!(rate_between(&Value::Counter(1), &Value::Derive(2), 1.0).is_nan());
    }

    #[test]
    fn test_range_check() {
        let ds = DataSource::new("v", DsType::Gauge, 0.0, 100.0);
        assert_eq!(ds.range_check(50.0), 50.0);
        assert!(ds.range_check(-1.0).is_nan());
        assert!(ds.range_check(100.5).is_nan());
        let unbounded = DataSource::unbounded("v", DsType::Gauge);
        assert_eq!(unbounded.range_check(-1e300), -1e300);
    }

    #[test]
    fn test_data_set_check() {
        let ds = if_octets();
        let ident = Identifier::new("h", "interface", "eth0", "if_octets", "");
        let good = ValueList::new(ident.clone(), [Value::Counter(1), Value::Counter(2)]);
        assert!(ds.check(&good).is_ok());

        let short = ValueList::new(ident.clone(), [Value::Counter(1)]);
        assert!(matches!(ds.check(&short), Err(CollectdError::InvariantViolated { .. })));

        let wrong_kind = ValueList::new(ident, [Value::Counter(1), Value::Gauge(2.0)]);
        assert!(ds.check(&wrong_kind).is_err());
    }

    #[test]
    fn test_parse_types_db_line() {
        let ds = DataSet::parse_types_db_line("if_octets  rx:COUNTER:0:U, tx:COUNTER:0:4294967295 # net")
            .unwrap()
            .unwrap();
        assert_eq!(ds.type_name, "if_octets");
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.sources[0].min, 0.0);
        assert!(ds.sources[0].max.is_nan());
        assert_eq!(ds.sources[1].max, 4294967295.0);

        assert!(DataSet::parse_types_db_line("# only a comment").unwrap().is_none());
        assert_eq!(ds.to_string(), "if_octets rx:COUNTER:0:U, tx:COUNTER:0:4294967295");
        assert!(DataSet::parse_types_db_line("broken").is_err());
        assert!(DataSet::parse_types_db_line("t v:GAUGE:0").is_err());
        assert!(DataSet::parse_types_db_line("t v:FLOAT:0:U").is_err());
    }

    #[test]
    fn test_registry_builtin_and_file() {
        let registry = DataSetRegistry::with_builtin_types();
        assert!(registry.get("load").is_some());
        assert_eq!(registry.get("cpu").unwrap().sources[0].ds_type, DsType::Derive);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# custom types").unwrap();
        writeln!(file, "cpu value:GAUGE:0:100").unwrap();
        writeln!(file, "queue_length value:GAUGE:0:U").unwrap();
        assert_eq!(registry.load_types_db(file.path()).unwrap(), 2);
        assert_eq!(registry.get("cpu").unwrap().sources[0].ds_type, DsType::Gauge);
        assert!(registry.get("queue_length").is_some());

        registry.unregister("queue_length").unwrap();
        assert!(registry.unregister("queue_length").is_err());
    }

    #[test]
    fn test_rate_to_value_gauge_passthrough() {
        let mut state = RateToValueState::default();
        let v = rate_to_value(2.5, &mut state, DsType::Gauge, CdTime::from_secs(10)).unwrap();
        assert_eq!(v, Some(Value::Gauge(2.5)));
    }

    #[test]
    fn test_rate_to_value_integrates_derive() {
        let mut state = RateToValueState::default();
        let first = rate_to_value(2.0, &mut state, DsType::Derive, CdTime::from_secs(10)).unwrap();
        assert_eq!(first, None);
        let second = rate_to_value(2.0, &mut state, DsType::Derive, CdTime::from_secs(20)).unwrap();
        assert_eq!(second, Some(Value::Derive(22)));
        let third = rate_to_value(-1.0, &mut state, DsType::Derive, CdTime::from_secs(30)).unwrap();
        assert_eq!(third, Some(Value::Derive(12)));
    }

    #[test]
    fn test_rate_to_value_rejects_negative_counter() {
        let mut state = RateToValueState::default();
        assert!(rate_to_value(-1.0, &mut state, DsType::Counter, CdTime::from_secs(1)).is_err());
        assert!(rate_to_value(1.0, &mut state, DsType::Counter, CdTime::from_secs(2))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rate_to_value_rejects_time_regression() {
        let mut state = RateToValueState::default();
        rate_to_value(1.0, &mut state, DsType::Absolute, CdTime::from_secs(10)).unwrap();
        assert!(rate_to_value(1.0, &mut state, DsType::Absolute, CdTime::from_secs(10)).is_err());
    }

    #[test]
    fn test_value_list_feedback_flag() {
        let mut vl = ValueList::new(Identifier::new("h", "p", "", "gauge", ""), [Value::Gauge(1.0)]);
        assert!(!vl.is_aggregation_created());
        vl.meta_mut().add_boolean(crate::meta::AGGREGATION_CREATED, true);
        assert!(vl.is_aggregation_created());
    }

    proptest! {
        #[test]
        fn prop_counter_diff_without_wrap_is_plain_subtraction(old in 0u64..u64::MAX / 2, step in 0u64..1_000_000) {
            prop_assert_eq!(counter_diff(old, old + step), step);
        }

        #[test]
        fn prop_counter_wrap_32_stays_below_2_32(old in 1u64..=u32::MAX as u64, new in 0u64..1_000) {
            prop_assume!(new < old);
            prop_assert!(counter_diff(old, new) <= u32::MAX as u64);
        }
    }
}
