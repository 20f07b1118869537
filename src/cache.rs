//! Value cache.
//!
//! Keeps the last raw sample of every identifier, the gauges derived from it,
//! an optional per-entry history ring and a lazily allocated metadata
//! container. Updates must strictly advance in time. Stale entries are found
//! and removed by a two-phase sweep that releases the lock before any
//! subscriber runs.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use ahash::RandomState;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::{CollectdError, CollectdResult};
use crate::identifier::Identifier;
use crate::meta::{MetaData, MetaValue};
use crate::time::CdTime;
use crate::types::{rate_between, DataSet, DsType, ValueList, Values};

// ============================================================================
// SECTION 1: CACHE TYPES
// ============================================================================

/// Derived gauges of one entry, one per data source.
pub type Gauges = SmallVec<[f64; 4]>;

/// Health of a cache entry, as seen by threshold consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EntryState {
    #[default]
    Okay,
    Warning,
    Error,
    Missing,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Okay => "okay",
            EntryState::Warning => "warning",
            EntryState::Error => "error",
            EntryState::Missing => "missing",
        }
    }
}

/// Lifecycle events surfaced to cache-event subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEventKind {
    New,
    Update,
    Expired,
    Missing,
}

impl Display for CacheEventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheEventKind::New => "NEW",
            CacheEventKind::Update => "UPDATE",
            CacheEventKind::Expired => "EXPIRED",
            CacheEventKind::Missing => "MISSING",
        })
    }
}

/// An event handed to subscribers. A subscriber sets `ret > 0` to suppress
/// further processing of the value list (or, for `Missing`, of the
/// notification).
#[derive(Debug)]
pub struct CacheEvent<'a> {
    pub kind: CacheEventKind,
    pub identifier: &'a Identifier,
    /// Present for `New` and `Update`.
    pub data_set: Option<&'a DataSet>,
    /// Present for `New` and `Update`.
    pub value_list: Option<&'a ValueList>,
    pub ret: i32,
}

impl<'a> CacheEvent<'a> {
    pub fn new(kind: CacheEventKind, identifier: &'a Identifier) -> Self {
        Self {
            kind,
            identifier,
            data_set: None,
            value_list: None,
            ret: 0,
        }
    }

    /// Event for an accepted sample.
    pub fn for_value_list(kind: CacheEventKind, ds: &'a DataSet, vl: &'a ValueList) -> Self {
        Self {
            kind,
            identifier: &vl.identifier,
            data_set: Some(ds),
            value_list: Some(vl),
            ret: 0,
        }
    }
}

/// Snapshot of an entry taken by the first phase of the sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredEntry {
    pub identifier: Identifier,
    pub name: String,
    pub last_time: CdTime,
    pub last_update: CdTime,
    pub interval: CdTime,
}

// ----------------------------------------------------------------------------
// 1.1 Cache Entry
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct CacheEntry {
    identifier: Identifier,
    name: String,
    /// Number of data sources, fixed at insertion
    arity: usize,
    last_raw: Values,
    last_gauge: Gauges,
    first_time: CdTime,
    /// Value-list time of the last accepted sample
    last_time: CdTime,
    /// Wall time the entry was last touched
    last_update: CdTime,
    interval: CdTime,
    state: EntryState,
    /// Ring of `history_length` rows of `arity` gauges
    history: Vec<f64>,
    history_index: usize,
    history_length: usize,
    meta: Option<MetaData>,
    hits: u64,
}

impl CacheEntry {
    fn new(ds: &DataSet, vl: &ValueList, name: String, now: CdTime, history_length: usize) -> CollectdResult<Self> {
        let arity = ds.len();
        let last_gauge: Gauges = vl
            .values
            .iter()
            .zip(&ds.sources)
            .map(|(value, source)| match source.ds_type {
                DsType::Gauge => source.range_check(value.as_f64()),
                _ => f64::NAN,
            })
            .collect();

        let mut entry = Self {
            identifier: vl.identifier.clone(),
            name,
            arity,
            last_raw: vl.values.clone(),
            last_gauge,
            first_time: vl.time,
            last_time: vl.time,
            last_update: now,
            interval: vl.interval,
            state: EntryState::Okay,
            history: Vec::new(),
            history_index: 0,
            history_length: 0,
            meta: None,
            hits: 0,
        };
        if history_length > 0 {
            entry.grow_history(history_length)?;
            entry.push_history();
        }
        Ok(entry)
    }

    fn update(&mut self, ds: &DataSet, vl: &ValueList, now: CdTime) -> CollectdResult<()> {
        if vl.values.len() != self.arity {
            return Err(CollectdError::invariant(format!(
                "{}: {} values for an entry with {} sources",
                self.name,
                vl.values.len(),
                self.arity
            )));
        }
        if vl.time <= self.last_time {
            return Err(CollectdError::TimeRegression {
                name: self.name.clone(),
                time: vl.time,
                last_time: self.last_time,
            });
        }

        let delta_secs = (vl.time - self.last_time).as_secs_f64();
        for (i, (value, source)) in vl.values.iter().zip(&ds.sources).enumerate() {
            let rate = rate_between(&self.last_raw[i], value, delta_secs);
            self.last_gauge[i] = source.range_check(rate);
        }

        self.last_raw = vl.values.clone();
        self.last_time = vl.time;
        self.last_update = now;
        self.interval = vl.interval;
        if self.state == EntryState::Missing {
            self.state = EntryState::Okay;
        }
        self.push_history();
        Ok(())
    }

    fn push_history(&mut self) {
        if self.history_length == 0 {
            return;
        }
        let start = self.history_index * self.arity;
        self.history[start..start + self.arity].copy_from_slice(&self.last_gauge);
        self.history_index = (self.history_index + 1) % self.history_length;
    }

    /// Enlarge the ring to `steps` rows, keeping recorded rows in order and
    /// padding the oldest positions with NaN.
    fn grow_history(&mut self, steps: usize) -> CollectdResult<()> {
        if steps <= self.history_length {
            return Ok(());
        }
        let mut grown: Vec<f64> = Vec::new();
        grown
            .try_reserve_exact(steps * self.arity)
            .map_err(|_| CollectdError::out_of_memory(format!("history of {}", self.name)))?;
        grown.resize((steps - self.history_length) * self.arity, f64::NAN);
        for k in 0..self.history_length {
            let row = (self.history_index + k) % self.history_length;
            grown.extend_from_slice(&self.history[row * self.arity..(row + 1) * self.arity]);
        }
        self.history = grown;
        self.history_length = steps;
        self.history_index = 0;
        Ok(())
    }

    /// The newest `steps` rows, newest first.
    fn history_rows(&self, steps: usize) -> Vec<Vec<f64>> {
        (0..steps)
            .map(|k| {
                let row = (self.history_index + self.history_length - 1 - k) % self.history_length;
                self.history[row * self.arity..(row + 1) * self.arity].to_vec()
            })
            .collect()
    }

    fn check_not_missing(&self) -> CollectdResult<()> {
        if self.state == EntryState::Missing {
            return Err(CollectdError::Stale {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// SECTION 2: VALUE CACHE
// ============================================================================

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry, RandomState>,
}

/// The process-wide value cache. One lock covers the index and its entries.
#[derive(Debug, Default)]
pub struct ValueCache {
    inner: Mutex<CacheInner>,
    /// Rows of history given to new entries; 0 disables history until asked.
    history_length: usize,
}

macro_rules! meta_proxy {
    ($add:ident, $get:ident, $meta_add:ident, $meta_get:ident, $ty:ty) => {
        pub fn $meta_add(&self, ident: &Identifier, key: &str, value: $ty) -> CollectdResult<()> {
            self.with_meta(ident, |meta| meta.$add(key, value))
        }

        pub fn $meta_get(&self, ident: &Identifier, key: &str) -> CollectdResult<$ty> {
            self.with_meta(ident, |meta| meta.$get(key))?
        }
    };
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache whose entries record `history_length` rows from insertion on.
    pub fn with_history(history_length: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            history_length,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    // ------------------------------------------------------------------------
    // 2.1 Updates
    // ------------------------------------------------------------------------

    /// Record a sample, stamping the entry with the current wall time.
    pub fn update(&self, ds: &DataSet, vl: &ValueList) -> CollectdResult<CacheEventKind> {
        self.update_at(ds, vl, CdTime::now())
    }

    /// Record a sample with an explicit wall time.
    pub fn update_at(&self, ds: &DataSet, vl: &ValueList, now: CdTime) -> CollectdResult<CacheEventKind> {
        if vl.values.len() != ds.len() {
            return Err(CollectdError::invariant(format!(
                "{}: {} values for data set '{}' with {} sources",
                vl.identifier,
                vl.values.len(),
                ds.type_name,
                ds.len()
            )));
        }
        let name = vl.identifier.to_string();

        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&name) {
            entry.update(ds, vl, now)?;
            trace!(target: "collectd::cache", name = %name, "Entry updated");
            return Ok(CacheEventKind::Update);
        }

        let entry = CacheEntry::new(ds, vl, name.clone(), now, self.history_length)?;
        inner
            .entries
            .try_reserve(1)
            .map_err(|_| CollectdError::out_of_memory(format!("cache entry for {}", name)))?;
        debug!(target: "collectd::cache", name = %name, "Entry created");
        inner.entries.insert(name, entry);
        Ok(CacheEventKind::New)
    }

    // ------------------------------------------------------------------------
    // 2.2 Reads
    // ------------------------------------------------------------------------

    fn with_entry<R>(&self, ident: &Identifier, f: impl FnOnce(&mut CacheEntry) -> R) -> CollectdResult<R> {
        let name = ident.to_string();
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&name)
            .ok_or_else(|| CollectdError::not_found(name.clone()))?;
        Ok(f(entry))
    }

    /// The derived gauges of `ident`.
    pub fn get_rate(&self, ident: &Identifier) -> CollectdResult<Gauges> {
        self.with_entry(ident, |entry| -> CollectdResult<Gauges> {
            entry.check_not_missing()?;
            Ok(entry.last_gauge.clone())
        })?
    }

    /// The last raw values of `ident`.
    pub fn get_value(&self, ident: &Identifier) -> CollectdResult<Values> {
        self.with_entry(ident, |entry| -> CollectdResult<Values> {
            entry.check_not_missing()?;
            Ok(entry.last_raw.clone())
        })?
    }

    /// `steps` rows of `arity` gauges, newest first, NaN where nothing was
    /// recorded. History is enlarged to `steps` rows on demand.
    pub fn get_history(&self, ident: &Identifier, steps: usize, arity: usize) -> CollectdResult<Vec<Vec<f64>>> {
        self.with_entry(ident, |entry| -> CollectdResult<Vec<Vec<f64>>> {
            if arity != entry.arity {
                return Err(CollectdError::invariant(format!(
                    "{}: history requested with {} columns, entry has {}",
                    entry.name, arity, entry.arity
                )));
            }
            if steps == 0 {
                return Ok(Vec::new());
            }
            entry.grow_history(steps)?;
            Ok(entry.history_rows(steps))
        })?
    }

    /// Names and last times of all entries, sorted by name.
    pub fn get_names(&self, exclude_missing: bool) -> Vec<(String, CdTime)> {
        let inner = self.inner.lock();
        let mut names: Vec<(String, CdTime)> = inner
            .entries
            .values()
            .filter(|e| !(exclude_missing && e.state == EntryState::Missing))
            .map(|e| (e.name.clone(), e.last_time))
            .collect();
        names.sort();
        names
    }

    pub fn first_time(&self, ident: &Identifier) -> CollectdResult<CdTime> {
        self.with_entry(ident, |entry| entry.first_time)
    }

    pub fn get_interval(&self, ident: &Identifier) -> CollectdResult<CdTime> {
        self.with_entry(ident, |entry| entry.interval)
    }

    // ------------------------------------------------------------------------
    // 2.3 State & Hits
    // ------------------------------------------------------------------------

    pub fn get_state(&self, ident: &Identifier) -> CollectdResult<EntryState> {
        self.with_entry(ident, |entry| entry.state)
    }

    /// Set the state, returning the previous one.
    pub fn set_state(&self, ident: &Identifier, state: EntryState) -> CollectdResult<EntryState> {
        self.with_entry(ident, |entry| std::mem::replace(&mut entry.state, state))
    }

    pub fn get_hits(&self, ident: &Identifier) -> CollectdResult<u64> {
        self.with_entry(ident, |entry| entry.hits)
    }

    /// Set the hit counter, returning the previous value.
    pub fn set_hits(&self, ident: &Identifier, hits: u64) -> CollectdResult<u64> {
        self.with_entry(ident, |entry| std::mem::replace(&mut entry.hits, hits))
    }

    /// Add `step` to the hit counter, returning the previous value.
    pub fn inc_hits(&self, ident: &Identifier, step: u64) -> CollectdResult<u64> {
        self.with_entry(ident, |entry| {
            let old = entry.hits;
            entry.hits = old.saturating_add(step);
            old
        })
    }

    // ------------------------------------------------------------------------
    // 2.4 Metadata Proxy
    // ------------------------------------------------------------------------

    fn with_meta<R>(&self, ident: &Identifier, f: impl FnOnce(&MetaData) -> R) -> CollectdResult<R> {
        self.with_entry(ident, |entry| f(entry.meta.get_or_insert_with(MetaData::new)))
    }

    pub fn meta_exists(&self, ident: &Identifier, key: &str) -> CollectdResult<bool> {
        self.with_meta(ident, |meta| meta.exists(key))
    }

    pub fn meta_delete(&self, ident: &Identifier, key: &str) -> CollectdResult<()> {
        self.with_meta(ident, |meta| meta.delete(key))?
    }

    pub fn meta_get(&self, ident: &Identifier, key: &str) -> CollectdResult<MetaValue> {
        self.with_meta(ident, |meta| meta.get(key))?
    }

    /// Keys of the entry's metadata in insertion order.
    pub fn meta_toc(&self, ident: &Identifier) -> CollectdResult<Vec<String>> {
        self.with_meta(ident, |meta| meta.toc())
    }

    meta_proxy!(add_string, get_string, meta_add_string, meta_get_string, String);
    meta_proxy!(add_signed_int, get_signed_int, meta_add_signed_int, meta_get_signed_int, i64);
    meta_proxy!(add_unsigned_int, get_unsigned_int, meta_add_unsigned_int, meta_get_unsigned_int, u64);
    meta_proxy!(add_double, get_double, meta_add_double, meta_get_double, f64);
    meta_proxy!(add_boolean, get_boolean, meta_add_boolean, meta_get_boolean, bool);

    // ------------------------------------------------------------------------
    // 2.5 Timeout Sweep
    // ------------------------------------------------------------------------

    /// First phase: mark every entry not touched for more than
    /// `interval * timeout_factor` as missing and snapshot it.
    pub fn collect_expired(&self, now: CdTime, timeout_factor: u64) -> Vec<ExpiredEntry> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        for entry in inner.entries.values_mut() {
            let timeout = entry.interval.saturating_mul(timeout_factor);
            if now.saturating_sub(entry.last_update) > timeout {
                entry.state = EntryState::Missing;
                expired.push(ExpiredEntry {
                    identifier: entry.identifier.clone(),
                    name: entry.name.clone(),
                    last_time: entry.last_time,
                    last_update: entry.last_update,
                    interval: entry.interval,
                });
            }
        }
        expired.sort_by(|a, b| a.name.cmp(&b.name));
        expired
    }

    /// Last phase: drop the snapshotted entries, even if they were updated
    /// in between.
    pub fn remove_expired(&self, expired: &[ExpiredEntry]) -> usize {
        let mut inner = self.inner.lock();
        expired
            .iter()
            .filter(|e| inner.entries.remove(&e.name).is_some())
            .count()
    }

    /// Run the whole sweep. `on_missing` runs between the phases with no
    /// cache lock held and may re-enter the cache.
    pub fn check_timeout_at(
        &self,
        now: CdTime,
        timeout_factor: u64,
        mut on_missing: impl FnMut(&ExpiredEntry),
    ) -> Vec<ExpiredEntry> {
        let expired = self.collect_expired(now, timeout_factor);
        if expired.is_empty() {
            return expired;
        }
        for entry in &expired {
            on_missing(entry);
        }
        let removed = self.remove_expired(&expired);
        debug!(target: "collectd::cache", expired = expired.len(), removed, "Timeout sweep finished");
        expired
    }
}

// ============================================================================
// SECTION 3: TESTS
// ============================================================================
