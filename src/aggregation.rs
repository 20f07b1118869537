//! Aggregation of many value lists into a few.
//!
//! Each `<Aggregation>` block becomes a lookup template. Every value list
//! the cache accepts is matched against the templates; the rate of a match
//! is folded into the instance selected by the template's group-by fields.
//! A periodic read turns each instance into one value list per enabled
//! function and resets it.

use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::smallvec;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEvent, CacheEventKind};
use crate::config::ConfigItem;
use crate::error::{CollectdError, CollectdResult, ConfigError, ConfigResult};
use crate::identifier::{is_regex_pattern, Field, Identifier, CATCH_ALL};
use crate::lookup::{GroupBy, LookupEngine, TemplateId, UpdateStatus};
use crate::meta::{MetaData, AGGREGATION_CREATED};
use crate::plugin::{ReadContext, Registry};
use crate::time::CdTime;
use crate::types::{rate_to_value, DataSet, DsType, RateToValueState, ValueList};

/// Name used for the read, the cache subscription and emitted value lists.
pub const PLUGIN_NAME: &str = "aggregation";

/// Replaced by the function name in the emitted plugin instance.
const FUNC_PLACEHOLDER: &str = "%{aggregation}";

// ============================================================================
// SECTION 1: CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggFunc {
    Num,
    Sum,
    Average,
    Min,
    Max,
    Stddev,
}

impl AggFunc {
    /// Emission order.
    pub const ALL: [AggFunc; 6] = [
        AggFunc::Num,
        AggFunc::Sum,
        AggFunc::Average,
        AggFunc::Min,
        AggFunc::Max,
        AggFunc::Stddev,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Num => "num",
            AggFunc::Sum => "sum",
            AggFunc::Average => "average",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Stddev => "stddev",
        }
    }

    fn config_key(&self) -> &'static str {
        match self {
            AggFunc::Num => "CalculateNum",
            AggFunc::Sum => "CalculateSum",
            AggFunc::Average => "CalculateAverage",
            AggFunc::Min => "CalculateMinimum",
            AggFunc::Max => "CalculateMaximum",
            AggFunc::Stddev => "CalculateStddev",
        }
    }
}

impl Display for AggFunc {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `<Aggregation>` block.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationConfig {
    /// Selection pattern; unset fields are the catch-all
    pub pattern: Identifier,
    pub group_by: GroupBy,
    pub set_host: Option<String>,
    pub set_plugin: Option<String>,
    pub set_plugin_instance: Option<String>,
    pub set_type_instance: Option<String>,
    /// Enabled functions in emission order
    pub functions: Vec<AggFunc>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            pattern: Identifier::new(CATCH_ALL, CATCH_ALL, CATCH_ALL, CATCH_ALL, CATCH_ALL),
            group_by: GroupBy::empty(),
            set_host: None,
            set_plugin: None,
            set_plugin_instance: None,
            set_type_instance: None,
            functions: Vec::new(),
        }
    }
}

impl AggregationConfig {
    /// Parse an `<Aggregation>` block.
    pub fn from_item(item: &ConfigItem) -> ConfigResult<Self> {
        let mut config = Self::default();
        let mut enabled = [false; 6];
        for child in &item.children {
            let key = child.key.to_ascii_lowercase();
            match key.as_str() {
                "host" => config.pattern.host = child.string()?.into(),
                "plugin" => config.pattern.plugin = child.string()?.into(),
                "plugininstance" => config.pattern.plugin_instance = child.string()?.into(),
                "type" => config.pattern.type_name = child.string()?.into(),
                "typeinstance" => config.pattern.type_instance = child.string()?.into(),
                "sethost" => config.set_host = Some(child.string()?.to_string()),
                "setplugin" => config.set_plugin = Some(child.string()?.to_string()),
                "setplugininstance" => config.set_plugin_instance = Some(child.string()?.to_string()),
                "settypeinstance" => config.set_type_instance = Some(child.string()?.to_string()),
                "groupby" => {
                    for value in &child.values {
                        let name = match value {
                            crate::config::ConfigValue::String(s) => s.as_str(),
                            other => {
                                warn!(target: "collectd::aggregation", value = %other, "GroupBy argument is not a string");
                                continue;
                            }
                        };
                        match name.to_ascii_lowercase().as_str() {
                            "host" => config.group_by.insert(Field::Host),
                            "plugin" => config.group_by.insert(Field::Plugin),
                            "plugininstance" => config.group_by.insert(Field::PluginInstance),
                            "typeinstance" => config.group_by.insert(Field::TypeInstance),
                            "type" => {
                                error!(target: "collectd::aggregation", "Grouping by type is not supported");
                                false
                            }
                            _ => {
                                warn!(target: "collectd::aggregation", value = %name, "Invalid GroupBy argument ignored");
                                false
                            }
                        };
                    }
                }
                _ => match AggFunc::ALL.iter().position(|f| f.config_key().eq_ignore_ascii_case(&key)) {
                    Some(idx) => enabled[idx] = child.boolean()?,
                    None => warn!(
                        target: "collectd::aggregation",
                        key = %child.key,
                        "Key not allowed inside Aggregation blocks, ignored"
                    ),
                },
            }
        }
        config.functions = AggFunc::ALL
            .iter()
            .zip(enabled)
            .filter_map(|(f, on)| on.then_some(*f))
            .collect();
        config.validate()?;
        Ok(config)
    }

    fn is_wildcard(&self, field: Field) -> bool {
        is_regex_pattern(self.pattern.field(field))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let type_name = self.pattern.type_name.as_str();
        if type_name == CATCH_ALL || type_name.is_empty() {
            return Err(ConfigError::missing_field(format!("Type (aggregation {})", self.pattern)));
        }
        if type_name.contains('/') {
            return Err(ConfigError::invalid_value("Type", format!("'{}' may not be a regex", type_name)));
        }

        let grouped = [Field::Host, Field::Plugin, Field::PluginInstance, Field::TypeInstance];
        if !grouped
            .iter()
            .any(|&f| self.is_wildcard(f) && !self.group_by.contains(f))
        {
            return Err(ConfigError::invalid_value(
                "GroupBy",
                format!("aggregation {} needs at least one wildcard field that is not grouped", self.pattern),
            ));
        }
        if let Some(field) = self.group_by.fields().into_iter().find(|&f| !self.is_wildcard(f)) {
            return Err(ConfigError::invalid_value(
                "GroupBy",
                format!("{} is not a wildcard field in aggregation {}", field.as_str(), self.pattern),
            ));
        }
        if self.functions.is_empty() {
            return Err(ConfigError::invalid_value(
                "Calculate",
                format!("no aggregation function enabled for {}", self.pattern),
            ));
        }
        Ok(())
    }

    /// The identifier an instance emits under. Its plugin instance still
    /// carries the function placeholder.
    fn output_identifier(&self, vl: &ValueList) -> Identifier {
        let pick = |field: Field, set: &Option<String>, all_value: &str| -> String {
            if let Some(value) = set {
                value.clone()
            } else if self.is_wildcard(field) && self.group_by.contains(field) {
                vl.identifier.field(field).to_string()
            } else if self.is_wildcard(field) && self.pattern.field(field) == CATCH_ALL {
                all_value.to_string()
            } else {
                self.pattern.field(field).to_string()
            }
        };

        let host = pick(Field::Host, &self.set_host, "global");
        let plugin = self.set_plugin.clone().unwrap_or_else(|| PLUGIN_NAME.to_string());
        let plugin_instance = match &self.set_plugin_instance {
            Some(value) => value.clone(),
            None => {
                let parts = [
                    pick(Field::Plugin, &None, ""),
                    pick(Field::PluginInstance, &None, ""),
                    FUNC_PLACEHOLDER.to_string(),
                ];
                parts
                    .iter()
                    .filter(|p| !p.is_empty())
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join("-")
            }
        };
        let type_instance = pick(Field::TypeInstance, &self.set_type_instance, "");
        Identifier::new(host, plugin, plugin_instance, self.pattern.type_name.clone(), type_instance)
    }
}

// ============================================================================
// SECTION 2: INSTANCES
// ============================================================================

#[derive(Debug)]
struct Accumulator {
    num: u64,
    sum: f64,
    squares_sum: f64,
    min: f64,
    max: f64,
    /// One per enabled function, in emission order
    states: Vec<(AggFunc, RateToValueState)>,
}

impl Accumulator {
    fn reset(&mut self) {
        self.num = 0;
        self.sum = 0.0;
        self.squares_sum = 0.0;
        self.min = f64::NAN;
        self.max = f64::NAN;
    }

    fn add(&mut self, rate: f64) {
        self.num += 1;
        self.sum += rate;
        self.squares_sum += rate * rate;
        if self.min.is_nan() || self.min > rate {
            self.min = rate;
        }
        if self.max.is_nan() || self.max < rate {
            self.max = rate;
        }
    }

    fn result(&self, func: AggFunc) -> Option<f64> {
        let n = self.num as f64;
        match func {
            AggFunc::Num => Some(n),
            _ if self.num == 0 => None,
            AggFunc::Sum => Some(self.sum),
            AggFunc::Average => Some(self.sum / n),
            AggFunc::Min => Some(self.min),
            AggFunc::Max => Some(self.max),
            AggFunc::Stddev => Some(((n * self.squares_sum - self.sum * self.sum) / (n * n)).sqrt()),
        }
    }
}

/// The running state for one group of matching value lists.
#[derive(Debug)]
pub struct AggregationInstance {
    identifier: Identifier,
    ds_type: DsType,
    acc: Mutex<Accumulator>,
}

impl AggregationInstance {
    fn new(config: &AggregationConfig, ds: &DataSet, vl: &ValueList) -> CollectdResult<Self> {
        let source = ds
            .sources
            .first()
            .ok_or_else(|| CollectdError::invariant(format!("data set '{}' has no sources", ds.type_name)))?;
        Ok(Self {
            identifier: config.output_identifier(vl),
            ds_type: source.ds_type,
            acc: Mutex::new(Accumulator {
                num: 0,
                sum: 0.0,
                squares_sum: 0.0,
                min: f64::NAN,
                max: f64::NAN,
                states: config
                    .functions
                    .iter()
                    .map(|f| (*f, RateToValueState::default()))
                    .collect(),
            }),
        })
    }

    /// Output identifier; the plugin instance holds `%{aggregation}`.
    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn num(&self) -> u64 {
        self.acc.lock().num
    }

    fn plugin_instance_for(&self, func: AggFunc) -> String {
        if self.identifier.plugin_instance.is_empty() {
            func.as_str().to_string()
        } else {
            self.identifier.plugin_instance.replace(FUNC_PLACEHOLDER, func.as_str())
        }
    }

    /// Convert the accumulated state into value lists and reset it.
    fn drain(&self, t: CdTime) -> Vec<ValueList> {
        let mut acc = self.acc.lock();
        let meta = MetaData::new();
        meta.add_boolean(AGGREGATION_CREATED, true);

        let mut out = Vec::with_capacity(acc.states.len());
        let results: Vec<(AggFunc, Option<f64>)> = acc.states.iter().map(|(f, _)| (*f, acc.result(*f))).collect();
        for ((func, result), (_, state)) in results.into_iter().zip(acc.states.iter_mut()) {
            let Some(rate) = result else { continue };
            match rate_to_value(rate, state, self.ds_type, t) {
                Ok(Some(value)) => {
                    let mut ident = self.identifier.clone();
                    ident.plugin_instance = self.plugin_instance_for(func).into();
                    out.push(ValueList {
                        identifier: ident,
                        time: t,
                        interval: CdTime::ZERO,
                        values: smallvec![value],
                        meta: Some(meta.clone()),
                    });
                }
                Ok(None) => {}
                Err(err) => warn!(
                    target: "collectd::aggregation",
                    instance = %self.identifier,
                    function = %func,
                    error = %err,
                    "rate_to_value failed"
                ),
            }
        }
        acc.reset();
        out
    }
}

// ============================================================================
// SECTION 3: AGGREGATOR
// ============================================================================

type Engine = LookupEngine<Arc<AggregationConfig>, AggregationInstance>;

pub struct Aggregator {
    engine: Engine,
}

impl Aggregator {
    /// The aggregator reads current rates from `registry`'s cache.
    pub fn new(registry: Weak<Registry>) -> Self {
        let engine = Engine::new(
            Box::new(|config: &Arc<AggregationConfig>, ds: &DataSet, vl: &ValueList, key: &Identifier| {
                debug!(target: "collectd::aggregation", key = %key, "Creating aggregation instance");
                AggregationInstance::new(config, ds, vl)
            }),
            Box::new(move |ds: &DataSet, vl: &ValueList, _config: &Arc<AggregationConfig>, instance: &AggregationInstance| {
                match registry.upgrade() {
                    Some(registry) => update_instance(&registry, ds, vl, instance),
                    None => UpdateStatus::Abort(CollectdError::ShuttingDown),
                }
            }),
        );
        Self { engine }
    }

    pub fn add(&self, config: AggregationConfig) -> CollectdResult<TemplateId> {
        config.validate()?;
        let pattern = config.pattern.clone();
        let group_by = config.group_by;
        let id = self.engine.add_template(pattern, group_by, Arc::new(config))?;
        Ok(id)
    }

    pub fn template_count(&self) -> usize {
        self.engine.template_count()
    }

    pub fn instances(&self) -> Vec<Arc<AggregationInstance>> {
        self.engine.instances()
    }

    /// Feed an accepted value list. Lists the aggregator produced itself
    /// are skipped.
    pub fn handle_event(&self, event: &mut CacheEvent<'_>) -> CollectdResult<()> {
        if !matches!(event.kind, CacheEventKind::New | CacheEventKind::Update) {
            return Ok(());
        }
        let (Some(ds), Some(vl)) = (event.data_set, event.value_list) else {
            return Ok(());
        };
        if vl.is_aggregation_created() {
            return Ok(());
        }
        self.engine.search(ds, vl).map(|_| ())
    }

    /// Emit and reset every instance at time `t`. Returns the number of
    /// value lists dispatched.
    pub fn read_at(&self, ctx: &ReadContext<'_>, t: CdTime) -> CollectdResult<usize> {
        let mut dispatched = 0;
        for instance in self.engine.instances() {
            for vl in instance.drain(t) {
                match ctx.dispatch(vl) {
                    Ok(()) => dispatched += 1,
                    Err(err) => warn!(
                        target: "collectd::aggregation",
                        instance = %instance.identifier,
                        error = %err,
                        "Dispatching aggregate failed"
                    ),
                }
            }
        }
        Ok(dispatched)
    }

    /// Subscribe to cache events and register the periodic read.
    pub fn register(self: Arc<Self>, registry: &Registry, interval: CdTime) -> CollectdResult<()> {
        let subscriber = Arc::clone(&self);
        registry.register_cache_event(
            PLUGIN_NAME,
            Arc::new(move |event: &mut CacheEvent<'_>| subscriber.handle_event(event)),
        )?;
        let reader = Arc::clone(&self);
        registry.register_read(
            PLUGIN_NAME,
            interval,
            None,
            Arc::new(move |ctx: &ReadContext<'_>| reader.read_at(ctx, CdTime::now()).map(|_| ())),
        )?;
        info!(
            target: "collectd::aggregation",
            templates = self.template_count(),
            "Aggregation registered"
        );
        Ok(())
    }

    /// Build an aggregator from the `<Plugin aggregation>` block.
    pub fn from_config(registry: Weak<Registry>, block: &ConfigItem) -> CollectdResult<Self> {
        let aggregator = Self::new(registry);
        for child in &block.children {
            if child.key_is("Aggregation") {
                aggregator.add(AggregationConfig::from_item(child)?)?;
            } else {
                warn!(
                    target: "collectd::aggregation",
                    key = %child.key,
                    "Key not allowed inside the aggregation plugin block, ignored"
                );
            }
        }
        Ok(aggregator)
    }
}

fn update_instance(registry: &Registry, ds: &DataSet, vl: &ValueList, instance: &AggregationInstance) -> UpdateStatus {
    if ds.len() != 1 {
        error!(
            target: "collectd::aggregation",
            type_name = %ds.type_name,
            sources = ds.len(),
            "Only data sets with a single source can be aggregated"
        );
        return UpdateStatus::Failed;
    }
    let rate = match registry.cache().get_rate(&vl.identifier) {
        Ok(rates) => rates[0],
        Err(err) => {
            error!(
                target: "collectd::aggregation",
                identifier = %vl.identifier,
                error = %err,
                "Unable to read the current rate"
            );
            return UpdateStatus::Failed;
        }
    };
    if !rate.is_nan() {
        instance.acc.lock().add(rate);
    }
    UpdateStatus::Success
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator").field("engine", &self.engine).finish()
    }
}

// ============================================================================
// SECTION 4: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigValue;
    use crate::plugin::{GlobalSettings, WriteFn};
    use crate::types::Value;
    use pretty_assertions::assert_eq;

    fn registry() -> Arc<Registry> {
        let registry = Arc::new(Registry::new(GlobalSettings {
            hostname: "agg-host".to_string(),
            interval: CdTime::from_secs(10),
            timeout_factor: 2,
        }));
        registry
            .data_sets()
            .register(DataSet::parse_types_db_line("cpu value:GAUGE:0:U").unwrap().unwrap());
        registry
    }

    fn cpu_config() -> AggregationConfig {
        AggregationConfig {
            pattern: Identifier::new(CATCH_ALL, "cpu", CATCH_ALL, "cpu", CATCH_ALL),
            group_by: GroupBy::empty().with(Field::PluginInstance),
            functions: vec![AggFunc::Sum, AggFunc::Average],
            ..AggregationConfig::default()
        }
    }

    fn capture(registry: &Registry) -> Arc<Mutex<Vec<ValueList>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = Arc::clone(&seen);
        let writer: WriteFn = Arc::new(move |_ds: &DataSet, vl: &ValueList| {
            if vl.is_aggregation_created() {
                seen_in_cb.lock().push(vl.clone());
            }
            Ok(())
        });
        registry.register_write("capture", writer).unwrap();
        seen
    }

    fn gauge(host: &str, pi: &str, ti: &str, t: CdTime, v: f64) -> ValueList {
        ValueList::new(Identifier::new(host, "cpu", pi, "cpu", ti), [Value::Gauge(v)]).with_time(t)
    }

    #[test]
    fn test_wildcard_aggregation_groups_by_plugin_instance() {
        let registry = registry();
        let aggregator = Arc::new(Aggregator::new(Arc::downgrade(&registry)));
        aggregator.add(cpu_config()).unwrap();
        Arc::clone(&aggregator).register(&registry, CdTime::from_secs(10)).unwrap();
        let seen = capture(&registry);

        let t0 = CdTime::from_secs(1_000_000);
        for pi in ["0", "1"] {
            for ti in ["user", "system"] {
                registry.dispatch_values(gauge("h1", pi, ti, t0, 10.0)).unwrap();
            }
        }
        assert_eq!(aggregator.instances().len(), 2);

        let ctx = ReadContext {
            registry: &registry,
            plugin: PLUGIN_NAME,
            interval: CdTime::from_secs(10),
        };
        let emitted = aggregator.read_at(&ctx, t0 + CdTime::from_secs(10)).unwrap();
        assert_eq!(emitted, 4);

        let seen = seen.lock();
        let mut found: Vec<(String, String, f64)> = seen
            .iter()
            .map(|vl| (vl.identifier.host.to_string(), vl.identifier.plugin_instance.to_string(), vl.values[0].as_f64()))
            .collect();
        found.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            found,
            vec![
                ("global".to_string(), "cpu-0-average".to_string(), 10.0),
                ("global".to_string(), "cpu-0-sum".to_string(), 20.0),
                ("global".to_string(), "cpu-1-average".to_string(), 10.0),
                ("global".to_string(), "cpu-1-sum".to_string(), 20.0),
            ]
        );
        assert!(seen.iter().all(|vl| vl.identifier.plugin == PLUGIN_NAME));
        assert!(seen.iter().all(|vl| vl.identifier.type_instance.is_empty()));
        // Emitted lists are not fed back into the instances.
        assert!(aggregator.instances().iter().all(|i| i.num() == 0));
    }

    #[test]
    fn test_num_is_emitted_without_samples() {
        let registry = registry();
        let aggregator = Aggregator::new(Arc::downgrade(&registry));
        let mut config = cpu_config();
        config.functions = vec![AggFunc::Num, AggFunc::Sum];
        aggregator.add(config).unwrap();
        let seen = capture(&registry);
        let subscriber = Arc::new(aggregator);
        let for_event = Arc::clone(&subscriber);
        registry
            .register_cache_event("aggregation", Arc::new(move |ev: &mut CacheEvent<'_>| for_event.handle_event(ev)))
            .unwrap();

        let t0 = CdTime::from_secs(2_000_000);
        registry.dispatch_values(gauge("h1", "0", "user", t0, 3.0)).unwrap();
        let ctx = ReadContext {
            registry: &registry,
            plugin: PLUGIN_NAME,
            interval: CdTime::from_secs(10),
        };
        assert_eq!(subscriber.read_at(&ctx, t0 + CdTime::from_secs(10)).unwrap(), 2);
        // Second read: no samples, only num (= 0) is emitted.
        assert_eq!(subscriber.read_at(&ctx, t0 + CdTime::from_secs(20)).unwrap(), 1);
        let last = seen.lock().last().cloned().unwrap();
        assert_eq!(last.identifier.plugin_instance, "cpu-0-num");
        assert_eq!(last.values[0].as_f64(), 0.0);
    }

    #[test]
    fn test_statistics() {
        let mut acc = Accumulator {
            num: 0,
            sum: 0.0,
            squares_sum: 0.0,
            min: f64::NAN,
            max: f64::NAN,
            states: Vec::new(),
        };
        assert_eq!(acc.result(AggFunc::Sum), None);
        for r in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            acc.add(r);
        }
        assert_eq!(acc.result(AggFunc::Num), Some(8.0));
        assert_eq!(acc.result(AggFunc::Average), Some(5.0));
        assert_eq!(acc.result(AggFunc::Min), Some(2.0));
        assert_eq!(acc.result(AggFunc::Max), Some(9.0));
        let stddev = acc.result(AggFunc::Stddev).unwrap();
        assert!((stddev - 2.0).abs() < 1e-12);
        acc.reset();
        assert_eq!(acc.result(AggFunc::Num), Some(0.0));
        assert!(acc.min.is_nan());
    }

    #[test]
    fn test_nan_rate_is_a_successful_no_op() {
        let registry = registry();
        let aggregator = Arc::new(Aggregator::new(Arc::downgrade(&registry)));
        aggregator
            .add(AggregationConfig {
                pattern: Identifier::new(CATCH_ALL, "net", CATCH_ALL, "derive", CATCH_ALL),
                functions: vec![AggFunc::Sum],
                ..AggregationConfig::default()
            })
            .unwrap();
        Arc::clone(&aggregator).register(&registry, CdTime::from_secs(10)).unwrap();

        let vl = ValueList::new(Identifier::new("h", "net", "eth0", "derive", ""), [Value::Derive(5)])
            .with_time(CdTime::from_secs(3_000_000));
        registry.dispatch_values(vl).unwrap();
        let instances = aggregator.instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].num(), 0);
    }

    #[test]
    fn test_output_naming() {
        let config = AggregationConfig {
            pattern: Identifier::new(CATCH_ALL, CATCH_ALL, "/^eth/", "if_octets", ""),
            group_by: GroupBy::empty().with(Field::Host),
            functions: vec![AggFunc::Sum],
            set_type_instance: Some("total".to_string()),
            ..AggregationConfig::default()
        };
        let vl = ValueList::new(Identifier::new("web1", "interface", "eth0", "if_octets", ""), []);
        let ident = config.output_identifier(&vl);
        assert_eq!(ident.host, "web1");
        assert_eq!(ident.plugin, PLUGIN_NAME);
        assert_eq!(ident.plugin_instance, "/^eth/-%{aggregation}");
        assert_eq!(ident.type_instance, "total");

        let all_wild = AggregationConfig {
            pattern: Identifier::new(CATCH_ALL, CATCH_ALL, CATCH_ALL, "load", CATCH_ALL),
            functions: vec![AggFunc::Max],
            ..AggregationConfig::default()
        };
        assert_eq!(all_wild.output_identifier(&vl).plugin_instance, FUNC_PLACEHOLDER);
    }

    #[test]
    fn test_validation() {
        let missing_type = AggregationConfig {
            functions: vec![AggFunc::Sum],
            ..AggregationConfig::default()
        };
        assert!(missing_type.validate().is_err());

        let regex_type = AggregationConfig {
            pattern: Identifier::new(CATCH_ALL, "cpu", CATCH_ALL, "/cpu/", CATCH_ALL),
            functions: vec![AggFunc::Sum],
            ..AggregationConfig::default()
        };
        assert!(regex_type.validate().is_err());

        let no_wildcard = AggregationConfig {
            pattern: Identifier::new("h", "cpu", "0", "cpu", "user"),
            functions: vec![AggFunc::Sum],
            ..AggregationConfig::default()
        };
        assert!(no_wildcard.validate().is_err());

        let group_literal = AggregationConfig {
            pattern: Identifier::new("h", "cpu", CATCH_ALL, "cpu", CATCH_ALL),
            group_by: GroupBy::empty().with(Field::Host),
            functions: vec![AggFunc::Sum],
            ..AggregationConfig::default()
        };
        assert!(group_literal.validate().is_err());

        let no_function = AggregationConfig {
            functions: Vec::new(),
            ..cpu_config()
        };
        assert!(no_function.validate().is_err());
        assert!(cpu_config().validate().is_ok());
    }

    #[test]
    fn test_from_item() {
        let item = ConfigItem::new("Aggregation")
            .with_child(ConfigItem::new("Plugin").with_value(ConfigValue::String("cpu".into())))
            .with_child(ConfigItem::new("Type").with_value(ConfigValue::String("cpu".into())))
            .with_child(
                ConfigItem::new("GroupBy")
                    .with_value(ConfigValue::String("Host".into()))
                    .with_value(ConfigValue::String("TypeInstance".into())),
            )
            .with_child(ConfigItem::new("CalculateStddev").with_value(ConfigValue::Boolean(true)))
            .with_child(ConfigItem::new("CalculateNum").with_value(ConfigValue::Boolean(true)));
        let config = AggregationConfig::from_item(&item).unwrap();
        assert_eq!(config.pattern, Identifier::new(CATCH_ALL, "cpu", CATCH_ALL, "cpu", CATCH_ALL));
        assert!(config.group_by.contains(Field::Host));
        assert!(config.group_by.contains(Field::TypeInstance));
        assert_eq!(config.functions, vec![AggFunc::Num, AggFunc::Stddev]);
    }
}
