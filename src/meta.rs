//! Thread-safe metadata container.
//!
//! An insertion-ordered map from case-insensitive keys to tagged values,
//! attached to value lists and cache entries. Writers and the aggregator use
//! it to pass out-of-band facts, most importantly the feedback flag
//! [`AGGREGATION_CREATED`].

use std::fmt::{self, Display, Formatter};

use parking_lot::Mutex;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::error::{CollectdError, CollectdResult};

// ============================================================================
// SECTION 1: META VALUES
// ============================================================================

/// Flag set on every value list produced by re-injecting writers.
pub const AGGREGATION_CREATED: &str = "aggregation:created";

/// Tag of a [`MetaValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaType {
    String,
    SignedInt,
    UnsignedInt,
    Double,
    Boolean,
    Nested,
}

impl MetaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaType::String => "string",
            MetaType::SignedInt => "signed_int",
            MetaType::UnsignedInt => "unsigned_int",
            MetaType::Double => "double",
            MetaType::Boolean => "boolean",
            MetaType::Nested => "nested",
        }
    }
}

impl Display for MetaType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged metadata value. `Nested` only appears in notification metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    String(String),
    SignedInt(i64),
    UnsignedInt(u64),
    Double(f64),
    Boolean(bool),
    Nested(Vec<MetaEntry>),
}

impl MetaValue {
    pub fn meta_type(&self) -> MetaType {
        match self {
            MetaValue::String(_) => MetaType::String,
            MetaValue::SignedInt(_) => MetaType::SignedInt,
            MetaValue::UnsignedInt(_) => MetaType::UnsignedInt,
            MetaValue::Double(_) => MetaType::Double,
            MetaValue::Boolean(_) => MetaType::Boolean,
            MetaValue::Nested(_) => MetaType::Nested,
        }
    }
}

impl Display for MetaValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::String(s) => f.write_str(s),
            MetaValue::SignedInt(v) => write!(f, "{}", v),
            MetaValue::UnsignedInt(v) => write!(f, "{}", v),
            MetaValue::Double(v) => write!(f, "{}", v),
            MetaValue::Boolean(v) => write!(f, "{}", v),
            MetaValue::Nested(entries) => {
                f.write_str("{")?;
                for (i, entry) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}={}", entry.key, entry.value)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl Serialize for MetaValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MetaValue::String(s) => serializer.serialize_str(s),
            MetaValue::SignedInt(v) => serializer.serialize_i64(*v),
            MetaValue::UnsignedInt(v) => serializer.serialize_u64(*v),
            MetaValue::Double(v) => serializer.serialize_f64(*v),
            MetaValue::Boolean(v) => serializer.serialize_bool(*v),
            MetaValue::Nested(entries) => serialize_entries(entries, serializer),
        }
    }
}

/// One key/value pair.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaEntry {
    pub key: String,
    pub value: MetaValue,
}

impl MetaEntry {
    pub fn new(key: impl Into<String>, value: MetaValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

fn serialize_entries<S: Serializer>(entries: &[MetaEntry], serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(entries.len()))?;
    for entry in entries {
        map.serialize_entry(&entry.key, &entry.value)?;
    }
    map.end()
}

// ============================================================================
// SECTION 2: META DATA CONTAINER
// ============================================================================

/// Insertion-ordered, case-insensitively keyed metadata map.
#[derive(Debug, Default)]
pub struct MetaData {
    entries: Mutex<Vec<MetaEntry>>,
}

macro_rules! typed_accessors {
    ($add:ident, $get:ident, $variant:ident, $ty:ty) => {
        pub fn $add(&self, key: &str, value: $ty) {
            self.insert(key, MetaValue::$variant(value));
        }

        pub fn $get(&self, key: &str) -> CollectdResult<$ty> {
            match self.get(key)? {
                MetaValue::$variant(v) => Ok(v),
                other => Err(CollectdError::TypeMismatch {
                    key: key.to_string(),
                    requested: MetaType::$variant.as_str(),
                    stored: other.meta_type().as_str(),
                }),
            }
        }
    };
}

impl MetaData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a container from entries, later keys replacing earlier ones.
    pub fn from_entries(entries: impl IntoIterator<Item = MetaEntry>) -> Self {
        let md = Self::new();
        for entry in entries {
            md.insert(&entry.key, entry.value);
        }
        md
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.key.eq_ignore_ascii_case(key))
    }

    pub fn meta_type(&self, key: &str) -> Option<MetaType> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.key.eq_ignore_ascii_case(key))
            .map(|e| e.value.meta_type())
    }

    /// Remove `key`, failing with `NotFound` when absent.
    pub fn delete(&self, key: &str) -> CollectdResult<()> {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.key.eq_ignore_ascii_case(key)) {
            Some(idx) => {
                entries.remove(idx);
                Ok(())
            }
            None => Err(CollectdError::not_found(format!("meta key '{}'", key))),
        }
    }

    /// Keys in insertion order.
    pub fn toc(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Insert or replace. A replaced entry keeps its position and its
    /// original key spelling; the value may change type.
    pub fn insert(&self, key: &str, value: MetaValue) {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.key.eq_ignore_ascii_case(key)) {
            Some(entry) => entry.value = value,
            None => entries.push(MetaEntry::new(key, value)),
        }
    }

    pub fn get(&self, key: &str) -> CollectdResult<MetaValue> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.key.eq_ignore_ascii_case(key))
            .map(|e| e.value.clone())
            .ok_or_else(|| CollectdError::not_found(format!("meta key '{}'", key)))
    }

    typed_accessors!(add_string, get_string, String, String);
    typed_accessors!(add_signed_int, get_signed_int, SignedInt, i64);
    typed_accessors!(add_unsigned_int, get_unsigned_int, UnsignedInt, u64);
    typed_accessors!(add_double, get_double, Double, f64);
    typed_accessors!(add_boolean, get_boolean, Boolean, bool);

    /// Copy of all entries in insertion order.
    pub fn entries(&self) -> Vec<MetaEntry> {
        self.entries.lock().clone()
    }

    /// Whether the feedback flag is set to true.
    pub fn is_aggregation_created(&self) -> bool {
        matches!(self.get_boolean(AGGREGATION_CREATED), Ok(true))
    }
}

impl Clone for MetaData {
    fn clone(&self) -> Self {
        Self {
            entries: Mutex::new(self.entries.lock().clone()),
        }
    }
}

impl PartialEq for MetaData {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        self.entries() == other.entries()
    }
}

impl Serialize for MetaData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries = self.entries.lock();
        serialize_entries(&entries, serializer)
    }
}

// ============================================================================
// SECTION 3: TESTS
// ============================================================================
