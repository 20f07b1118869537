//! Identifier lookup engine.
//!
//! Templates are indexed by type, then by literal plugin name, with a second
//! per-type list for templates whose plugin field is a pattern. A search
//! walks the literal list first, then the pattern list, and for every
//! template that matches resolves (or creates) the user instance selected by
//! the template's group-by key before handing the value list to the update
//! callback.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use ahash::RandomState;
use compact_str::CompactString;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tracing::{debug, trace};

use crate::error::{CollectdError, CollectdResult, ConfigError};
use crate::identifier::{is_regex_pattern, regex_body, Field, Identifier, CATCH_ALL};
use crate::types::{DataSet, ValueList};

// ============================================================================
// SECTION 1: FIELD MATCHERS
// ============================================================================

/// A compiled field pattern.
#[derive(Debug, Clone)]
pub enum FieldMatch {
    Literal(CompactString),
    /// `/.*/`, matched without running the regex engine.
    CatchAll,
    Regex(Regex),
}

impl FieldMatch {
    pub fn compile(pattern: &str) -> CollectdResult<Self> {
        if pattern == CATCH_ALL {
            return Ok(FieldMatch::CatchAll);
        }
        match regex_body(pattern) {
            Some(body) => Regex::new(body)
                .map(FieldMatch::Regex)
                .map_err(|e| CollectdError::RegexInvalid {
                    pattern: pattern.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(FieldMatch::Literal(pattern.into())),
        }
    }

    #[inline]
    pub fn is_match(&self, value: &str) -> bool {
        match self {
            FieldMatch::Literal(literal) => literal.as_str() == value,
            FieldMatch::CatchAll => true,
            FieldMatch::Regex(re) => re.is_match(value),
        }
    }

    /// True for the catch-all and for any delimited regex.
    pub fn is_pattern(&self) -> bool {
        !matches!(self, FieldMatch::Literal(_))
    }
}

// ----------------------------------------------------------------------------
// 1.1 Group-By Mask
// ----------------------------------------------------------------------------

/// Set of identifier fields an instance key is grouped by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GroupBy(u8);

impl GroupBy {
    pub const HOST: GroupBy = GroupBy(0x01);
    pub const PLUGIN: GroupBy = GroupBy(0x02);
    pub const PLUGIN_INSTANCE: GroupBy = GroupBy(0x04);
    pub const TYPE_INSTANCE: GroupBy = GroupBy(0x08);

    pub fn empty() -> Self {
        GroupBy(0)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    fn for_field(field: Field) -> Option<GroupBy> {
        match field {
            Field::Host => Some(Self::HOST),
            Field::Plugin => Some(Self::PLUGIN),
            Field::PluginInstance => Some(Self::PLUGIN_INSTANCE),
            Field::TypeInstance => Some(Self::TYPE_INSTANCE),
            Field::Type => None,
        }
    }

    pub fn contains(&self, field: Field) -> bool {
        Self::for_field(field).map_or(false, |bit| self.0 & bit.0 != 0)
    }

    /// Add `field`; the type cannot be grouped by.
    pub fn insert(&mut self, field: Field) -> bool {
        match Self::for_field(field) {
            Some(bit) => {
                self.0 |= bit.0;
                true
            }
            None => false,
        }
    }

    pub fn with(mut self, field: Field) -> Self {
        self.insert(field);
        self
    }

    /// Fields in identifier order.
    pub fn fields(&self) -> Vec<Field> {
        Field::ALL.into_iter().filter(|f| self.contains(*f)).collect()
    }
}

// ============================================================================
// SECTION 2: TEMPLATES & INSTANCES
// ============================================================================

/// Handle returned by [`LookupEngine::add_template`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateId(u64);

/// Outcome of the per-sample update callback.
#[derive(Debug)]
pub enum UpdateStatus {
    /// Counted as a match.
    Success,
    /// Not counted; matching continues.
    Failed,
    /// Stops matching and fails the search.
    Abort(CollectdError),
}

struct InstanceTable<I> {
    index: HashMap<Identifier, usize, RandomState>,
    list: Vec<Arc<I>>,
}

impl<I> Default for InstanceTable<I> {
    fn default() -> Self {
        Self {
            index: HashMap::default(),
            list: Vec::new(),
        }
    }
}

/// A registered rule: five field matchers, a group-by mask, the user's class
/// context and the instances created for it.
pub struct Template<C, I> {
    id: TemplateId,
    pattern: Identifier,
    matchers: [FieldMatch; 5],
    group_by: GroupBy,
    class: C,
    instances: Mutex<InstanceTable<I>>,
}

impl<C, I> Template<C, I> {
    fn matcher(&self, field: Field) -> &FieldMatch {
        let idx = match field {
            Field::Host => 0,
            Field::Plugin => 1,
            Field::PluginInstance => 2,
            Field::Type => 3,
            Field::TypeInstance => 4,
        };
        &self.matchers[idx]
    }

    pub fn id(&self) -> TemplateId {
        self.id
    }

    pub fn pattern(&self) -> &Identifier {
        &self.pattern
    }

    pub fn group_by(&self) -> GroupBy {
        self.group_by
    }

    pub fn class(&self) -> &C {
        &self.class
    }

    pub fn matches(&self, ident: &Identifier) -> bool {
        Field::ALL
            .into_iter()
            .all(|field| self.matcher(field).is_match(ident.field(field)))
    }

    /// The instance key of `ident`: each pattern field that is not grouped
    /// collapses to the catch-all.
    pub fn instance_key(&self, ident: &Identifier) -> Identifier {
        let mut key = ident.clone();
        for field in [Field::Host, Field::Plugin, Field::PluginInstance, Field::TypeInstance] {
            if self.matcher(field).is_pattern() && !self.group_by.contains(field) {
                *key.field_mut(field) = CompactString::new(CATCH_ALL);
            }
        }
        key
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().list.len()
    }
}

impl<C, I> fmt::Debug for Template<C, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("id", &self.id)
            .field("pattern", &self.pattern.to_string())
            .field("group_by", &self.group_by)
            .finish()
    }
}

// ============================================================================
// SECTION 3: LOOKUP ENGINE
// ============================================================================

/// Creates an instance for a new instance key.
pub type CreateInstanceFn<C, I> =
    Box<dyn Fn(&C, &DataSet, &ValueList, &Identifier) -> CollectdResult<I> + Send + Sync>;

/// Feeds one matching value list to an instance.
pub type UpdateInstanceFn<C, I> = Box<dyn Fn(&DataSet, &ValueList, &C, &I) -> UpdateStatus + Send + Sync>;

struct TypeBucket<C, I> {
    by_plugin: HashMap<CompactString, Vec<Arc<Template<C, I>>>, RandomState>,
    wildcard_plugin: Vec<Arc<Template<C, I>>>,
}

impl<C, I> Default for TypeBucket<C, I> {
    fn default() -> Self {
        Self {
            by_plugin: HashMap::default(),
            wildcard_plugin: Vec::new(),
        }
    }
}

struct EngineInner<C, I> {
    by_type: HashMap<CompactString, TypeBucket<C, I>, RandomState>,
    /// All templates in registration order
    templates: Vec<Arc<Template<C, I>>>,
}

pub struct LookupEngine<C, I> {
    inner: RwLock<EngineInner<C, I>>,
    create: CreateInstanceFn<C, I>,
    update: UpdateInstanceFn<C, I>,
    next_id: AtomicU64,
}

impl<C, I> LookupEngine<C, I> {
    pub fn new(create: CreateInstanceFn<C, I>, update: UpdateInstanceFn<C, I>) -> Self {
        Self {
            inner: RwLock::new(EngineInner {
                by_type: HashMap::default(),
                templates: Vec::new(),
            }),
            create,
            update,
            next_id: AtomicU64::new(1),
        }
    }

    // ------------------------------------------------------------------------
    // 3.1 Template Management
    // ------------------------------------------------------------------------

    /// Compile and index a template. The type field must be a literal.
    pub fn add_template(&self, pattern: Identifier, group_by: GroupBy, class: C) -> CollectdResult<TemplateId> {
        if pattern.type_name.is_empty() || is_regex_pattern(&pattern.type_name) {
            return Err(ConfigError::invalid_value("Type", "a lookup template needs a literal type").into());
        }
        let matchers = [
            FieldMatch::compile(&pattern.host)?,
            FieldMatch::compile(&pattern.plugin)?,
            FieldMatch::compile(&pattern.plugin_instance)?,
            FieldMatch::compile(&pattern.type_name)?,
            FieldMatch::compile(&pattern.type_instance)?,
        ];

        let id = TemplateId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        let template = Arc::new(Template {
            id,
            pattern,
            matchers,
            group_by,
            class,
            instances: Mutex::new(InstanceTable::default()),
        });

        let mut inner = self.inner.write();
        inner
            .templates
            .try_reserve(1)
            .map_err(|_| CollectdError::out_of_memory("lookup template table"))?;
        let bucket = inner.by_type.entry(template.pattern.type_name.clone()).or_default();
        if template.matcher(Field::Plugin).is_pattern() {
            bucket.wildcard_plugin.push(Arc::clone(&template));
        } else {
            bucket
                .by_plugin
                .entry(template.pattern.plugin.clone())
                .or_default()
                .push(Arc::clone(&template));
        }
        debug!(
            target: "collectd::lookup",
            template = %template.pattern,
            group_by = template.group_by.bits(),
            "Template added"
        );
        inner.templates.push(template);
        Ok(id)
    }

    /// Remove a template together with all of its instances.
    pub fn remove_template(&self, id: TemplateId) -> CollectdResult<()> {
        let mut inner = self.inner.write();
        let pos = inner
            .templates
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| CollectdError::not_found(format!("lookup template {}", id.0)))?;
        let template = inner.templates.remove(pos);

        let type_name = &template.pattern.type_name;
        let mut bucket_empty = false;
        if let Some(bucket) = inner.by_type.get_mut(type_name) {
            bucket.wildcard_plugin.retain(|t| t.id != id);
            if let Some(list) = bucket.by_plugin.get_mut(&template.pattern.plugin) {
                list.retain(|t| t.id != id);
                if list.is_empty() {
                    bucket.by_plugin.remove(&template.pattern.plugin);
                }
            }
            bucket_empty = bucket.by_plugin.is_empty() && bucket.wildcard_plugin.is_empty();
        }
        if bucket_empty {
            inner.by_type.remove(type_name);
        }
        Ok(())
    }

    pub fn template_count(&self) -> usize {
        self.inner.read().templates.len()
    }

    /// All templates in registration order.
    pub fn templates(&self) -> Vec<Arc<Template<C, I>>> {
        self.inner.read().templates.clone()
    }

    /// All instances, grouped by template in registration order.
    pub fn instances(&self) -> Vec<Arc<I>> {
        self.inner
            .read()
            .templates
            .iter()
            .flat_map(|t| t.instances.lock().list.clone())
            .collect()
    }

    // ------------------------------------------------------------------------
    // 3.2 Search
    // ------------------------------------------------------------------------

    fn find_or_create(&self, template: &Template<C, I>, ds: &DataSet, vl: &ValueList) -> CollectdResult<Arc<I>> {
        let key = template.instance_key(&vl.identifier);
        let mut table = template.instances.lock();
        if let Some(&idx) = table.index.get(&key) {
            return Ok(Arc::clone(&table.list[idx]));
        }

        let instance = Arc::new((self.create)(&template.class, ds, vl, &key)?);
        table
            .list
            .try_reserve(1)
            .map_err(|_| CollectdError::out_of_memory(format!("instance table of {}", template.pattern)))?;
        let idx = table.list.len();
        table.list.push(Arc::clone(&instance));
        trace!(target: "collectd::lookup", key = %key, "Instance created");
        table.index.insert(key, idx);
        Ok(instance)
    }

    /// Feed `vl` to every matching template. Returns the number of
    /// successful updates.
    ///
    /// The callbacks run without the template index locked, so they may add
    /// or remove templates.
    pub fn search(&self, ds: &DataSet, vl: &ValueList) -> CollectdResult<usize> {
        let matching: Vec<Arc<Template<C, I>>> = {
            let inner = self.inner.read();
            let Some(bucket) = inner.by_type.get(&vl.identifier.type_name) else {
                return Ok(0);
            };
            let literal = bucket.by_plugin.get(&vl.identifier.plugin);
            let found = literal
                .into_iter()
                .flatten()
                .chain(bucket.wildcard_plugin.iter())
                .filter(|template| template.matches(&vl.identifier))
                .cloned()
                .collect();
            found
        };

        let mut successes = 0;
        for template in &matching {
            let instance = self.find_or_create(template, ds, vl)?;
            match (self.update)(ds, vl, &template.class, &instance) {
                UpdateStatus::Success => successes += 1,
                UpdateStatus::Failed => {}
                UpdateStatus::Abort(err) => return Err(err),
            }
        }
        Ok(successes)
    }
}

impl<C, I> fmt::Debug for LookupEngine<C, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupEngine")
            .field("templates", &self.template_count())
            .finish()
    }
}

// ============================================================================
// SECTION 4: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataSource, DsType, Value};
    use once_cell::sync::OnceCell;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;

    /// Class context: a name that is recorded on every update.
    type Log = Arc<Mutex<Vec<String>>>;

    struct Counter {
        key: Identifier,
        hits: AtomicUsize,
    }

    fn engine(log: Log) -> LookupEngine<&'static str, Counter> {
        LookupEngine::new(
            Box::new(|_class, _ds, _vl, key| {
                Ok(Counter {
                    key: key.clone(),
                    hits: AtomicUsize::new(0),
                })
            }),
            Box::new(move |_ds, vl, class, instance| {
                instance.hits.fetch_add(1, AtomicOrdering::Relaxed);
                log.lock().push(format!("{}:{}", class, vl.identifier));
                match *class {
                    "fail" => UpdateStatus::Failed,
                    "abort" => UpdateStatus::Abort(CollectdError::callback("abort", "stop")),
                    _ => UpdateStatus::Success,
                }
            }),
        )
    }

    fn cpu_ds() -> DataSet {
        DataSet::new("cpu", vec![DataSource::unbounded("value", DsType::Gauge)])
    }

    fn cpu_vl(host: &str, pi: &str, ti: &str) -> ValueList {
        ValueList::new(Identifier::new(host, "cpu", pi, "cpu", ti), [Value::Gauge(1.0)])
    }

    fn pattern(host: &str, plugin: &str, pi: &str, ti: &str) -> Identifier {
        Identifier::new(host, plugin, pi, "cpu", ti)
    }

    #[test]
    fn test_field_match_compile() {
        assert!(matches!(FieldMatch::compile("/.*/").unwrap(), FieldMatch::CatchAll));
        assert!(matches!(FieldMatch::compile("/^eth/").unwrap(), FieldMatch::Regex(_)));
        assert!(matches!(FieldMatch::compile("eth0").unwrap(), FieldMatch::Literal(_)));
        assert!(matches!(
            FieldMatch::compile("/[unclosed/"),
            Err(CollectdError::RegexInvalid { .. })
        ));
    }

    #[test]
    fn test_regex_is_unanchored() {
        let m = FieldMatch::compile("/eth/").unwrap();
        assert!(m.is_match("veth0"));
        assert!(!m.is_match("lo"));
    }

    #[test]
    fn test_group_by_mask() {
        let g = GroupBy::empty().with(Field::PluginInstance).with(Field::Host);
        assert!(g.contains(Field::Host));
        assert!(!g.contains(Field::TypeInstance));
        assert_eq!(g.bits(), 0x05);
        let mut t = GroupBy::empty();
        assert!(!t.insert(Field::Type));
        assert_eq!(g.fields(), vec![Field::Host, Field::PluginInstance]);
    }

    #[test]
    fn test_unknown_type_matches_nothing() {
        let log = Log::default();
        let engine = engine(Arc::clone(&log));
        engine
            .add_template(pattern("/.*/", "cpu", "/.*/", "/.*/"), GroupBy::empty(), "a")
            .unwrap();
        let ds = DataSet::new("load", vec![DataSource::unbounded("v", DsType::Gauge)]);
        let vl = ValueList::new(Identifier::new("h", "cpu", "", "load", ""), [Value::Gauge(1.0)]);
        assert_eq!(engine.search(&ds, &vl).unwrap(), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_group_by_creates_one_instance_per_key() {
        let engine = engine(Log::default());
        let id = engine
            .add_template(
                pattern("/.*/", "cpu", "/.*/", "/.*/"),
                GroupBy::empty().with(Field::PluginInstance),
                "agg",
            )
            .unwrap();

        let ds = cpu_ds();
        for (pi, ti) in [("0", "user"), ("0", "system"), ("1", "user"), ("1", "system")] {
            assert_eq!(engine.search(&ds, &cpu_vl("h", pi, ti)).unwrap(), 1);
        }

        let template = engine.templates().into_iter().find(|t| t.id() == id).unwrap();
        assert_eq!(template.instance_count(), 2);

        let keys: Vec<String> = engine.instances().iter().map(|c| c.key.to_string()).collect();
        assert_eq!(keys, vec!["/.*//cpu-0/cpu-/.*/".to_string(), "/.*//cpu-1/cpu-/.*/".to_string()]);
        assert!(engine
            .instances()
            .iter()
            .all(|c| c.hits.load(AtomicOrdering::Relaxed) == 2));
    }

    #[test]
    fn test_literal_list_before_wildcard_list() {
        let log = Log::default();
        let engine = engine(Arc::clone(&log));
        engine
            .add_template(pattern("/.*/", "/.*/", "/.*/", "/.*/"), GroupBy::empty(), "wild")
            .unwrap();
        engine
            .add_template(pattern("/.*/", "cpu", "/.*/", "/.*/"), GroupBy::empty(), "literal")
            .unwrap();

        assert_eq!(engine.search(&cpu_ds(), &cpu_vl("h", "0", "user")).unwrap(), 2);
        let order: Vec<String> = log.lock().iter().map(|e| e.split(':').next().unwrap().to_string()).collect();
        assert_eq!(order, vec!["literal".to_string(), "wild".to_string()]);
    }

    #[test]
    fn test_field_mismatch_skips_template() {
        let engine = engine(Log::default());
        engine
            .add_template(pattern("/^web/", "cpu", "/.*/", "user"), GroupBy::empty(), "a")
            .unwrap();
        let ds = cpu_ds();
        assert_eq!(engine.search(&ds, &cpu_vl("db1", "0", "user")).unwrap(), 0);
        assert_eq!(engine.search(&ds, &cpu_vl("web1", "0", "system")).unwrap(), 0);
        assert_eq!(engine.search(&ds, &cpu_vl("web1", "0", "user")).unwrap(), 1);
    }

    #[test]
    fn test_failed_is_not_counted_and_abort_stops() {
        let log = Log::default();
        let engine = engine(Arc::clone(&log));
        engine
            .add_template(pattern("/.*/", "cpu", "/.*/", "/.*/"), GroupBy::empty(), "fail")
            .unwrap();
        engine
            .add_template(pattern("/.*/", "cpu", "/.*/", "/.*/"), GroupBy::empty(), "ok")
            .unwrap();
        assert_eq!(engine.search(&cpu_ds(), &cpu_vl("h", "0", "user")).unwrap(), 1);

        engine
            .add_template(pattern("/.*/", "cpu", "/.*/", "/.*/"), GroupBy::empty(), "abort")
            .unwrap();
        engine
            .add_template(pattern("/.*/", "cpu", "/.*/", "/.*/"), GroupBy::empty(), "never")
            .unwrap();
        log.lock().clear();
        assert!(engine.search(&cpu_ds(), &cpu_vl("h", "0", "user")).is_err());
        assert!(!log.lock().iter().any(|e| e.starts_with("never")));
    }

    #[test]
    fn test_add_rejects_bad_templates() {
        let engine = engine(Log::default());
        let regex_type = Identifier::new("/.*/", "cpu", "", "/.*/", "");
        assert!(matches!(
            engine.add_template(regex_type, GroupBy::empty(), "a"),
            Err(CollectdError::Config(_))
        ));
        assert!(matches!(
            engine.add_template(pattern("/(/", "cpu", "", ""), GroupBy::empty(), "a"),
            Err(CollectdError::RegexInvalid { .. })
        ));
        assert_eq!(engine.template_count(), 0);
    }

    #[test]
    fn test_update_callback_may_add_templates() {
        type Engine = LookupEngine<&'static str, Counter>;
        let slot: Arc<OnceCell<Weak<Engine>>> = Arc::default();
        let handle = Arc::clone(&slot);
        let engine = Arc::new(Engine::new(
            Box::new(|_class, _ds, _vl, key| {
                Ok(Counter {
                    key: key.clone(),
                    hits: AtomicUsize::new(0),
                })
            }),
            Box::new(move |_ds, _vl, class, _instance| {
                if *class == "first" {
                    if let Some(engine) = handle.get().and_then(Weak::upgrade) {
                        engine
                            .add_template(pattern("/.*/", "cpu", "/.*/", "/.*/"), GroupBy::empty(), "late")
                            .unwrap();
                    }
                }
                UpdateStatus::Success
            }),
        ));
        slot.set(Arc::downgrade(&engine)).unwrap();
        engine
            .add_template(pattern("/.*/", "cpu", "/.*/", "/.*/"), GroupBy::empty(), "first")
            .unwrap();

        assert_eq!(engine.search(&cpu_ds(), &cpu_vl("h", "0", "user")).unwrap(), 1);
        assert_eq!(engine.template_count(), 2);
        assert_eq!(engine.search(&cpu_ds(), &cpu_vl("h", "0", "user")).unwrap(), 2);
    }

    #[test]
    fn test_remove_template_drops_instances() {
        let engine = engine(Log::default());
        let id = engine
            .add_template(pattern("/.*/", "cpu", "/.*/", "/.*/"), GroupBy::empty(), "a")
            .unwrap();
        engine.search(&cpu_ds(), &cpu_vl("h", "0", "user")).unwrap();
        assert_eq!(engine.instances().len(), 1);

        engine.remove_template(id).unwrap();
        assert!(engine.instances().is_empty());
        assert_eq!(engine.search(&cpu_ds(), &cpu_vl("h", "0", "user")).unwrap(), 0);
        assert!(engine.remove_template(id).is_err());
    }
}
