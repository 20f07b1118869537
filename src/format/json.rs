//! Streaming JSON array of value lists.
//!
//! `initialize` opens the array, every `value_list` appends one element
//! followed by a comma and `finalize` overwrites the trailing comma with the
//! closing bracket. The buffer has a fixed capacity; a value list that does
//! not fit is refused with [`FormatError::BufferFull`] so the writer can
//! flush and retry.

use serde::Serialize;
use serde_json::{Number, Value as JsonValue};

use super::FormatError;
use crate::meta::MetaData;
use crate::time::CdTime;
use crate::types::{DataSet, DsType, Value, ValueList};

#[derive(Serialize)]
struct JsonValueList<'a> {
    values: Vec<JsonValue>,
    dstypes: Vec<&'static str>,
    dsnames: Vec<&'a str>,
    time: f64,
    interval: f64,
    host: &'a str,
    plugin: &'a str,
    plugin_instance: &'a str,
    #[serde(rename = "type")]
    type_name: &'a str,
    type_instance: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<&'a MetaData>,
}

/// Non-finite numbers become `null`.
fn number(v: f64) -> JsonValue {
    Number::from_f64(v).map(JsonValue::Number).unwrap_or(JsonValue::Null)
}

fn millis_precision(t: CdTime) -> f64 {
    t.as_millis() as f64 / 1000.0
}

/// Render one value list as a JSON object.
pub fn value_list_to_json(ds: &DataSet, vl: &ValueList, rates: Option<&[f64]>) -> Result<String, FormatError> {
    if vl.values.len() != ds.len() || rates.is_some_and(|r| r.len() != ds.len()) {
        return Err(FormatError::Mismatch {
            identifier: vl.identifier.to_string(),
            type_name: ds.type_name.to_string(),
        });
    }

    let values = ds
        .sources
        .iter()
        .zip(&vl.values)
        .enumerate()
        .map(|(i, (source, value))| match (value, rates) {
            (Value::Gauge(g), _) => number(*g),
            (_, Some(rates)) if source.ds_type != DsType::Gauge => number(rates[i]),
            (Value::Counter(v), _) | (Value::Absolute(v), _) => JsonValue::from(*v),
            (Value::Derive(v), _) => JsonValue::from(*v),
        })
        .collect();

    let id = &vl.identifier;
    let element = JsonValueList {
        values,
        dstypes: ds.sources.iter().map(|s| s.ds_type.as_str()).collect(),
        dsnames: ds.sources.iter().map(|s| s.name.as_str()).collect(),
        time: millis_precision(vl.time),
        interval: millis_precision(vl.interval),
        host: &id.host,
        plugin: &id.plugin,
        plugin_instance: &id.plugin_instance,
        type_name: &id.type_name,
        type_instance: &id.type_instance,
        meta: vl.meta.as_ref().filter(|m| !m.is_empty()),
    };
    Ok(serde_json::to_string(&element)?)
}

/// Fixed-capacity buffer holding one JSON array under construction.
#[derive(Debug, Clone)]
pub struct JsonBuffer {
    buf: String,
    capacity: usize,
    records: usize,
}

impl JsonBuffer {
    pub fn new(capacity: usize) -> Self {
        let mut buffer = Self {
            buf: String::with_capacity(capacity.min(1 << 20)),
            capacity,
            records: 0,
        };
        buffer.initialize();
        buffer
    }

    /// Start a new, empty array.
    pub fn initialize(&mut self) {
        self.buf.clear();
        self.buf.push('[');
        self.records = 0;
    }

    /// Append one value list. Leaves the buffer unchanged when it does not
    /// fit.
    pub fn value_list(&mut self, ds: &DataSet, vl: &ValueList, rates: Option<&[f64]>) -> Result<(), FormatError> {
        let element = value_list_to_json(ds, vl, rates)?;
        // element, comma, and room for the closing bracket
        let needed = element.len() + 1;
        let available = self.capacity.saturating_sub(self.buf.len() + 1);
        if needed > available {
            return Err(FormatError::BufferFull { needed, available });
        }
        self.buf.push_str(&element);
        self.buf.push(',');
        self.records += 1;
        Ok(())
    }

    /// Close the array and return it. Call `initialize` before reuse.
    pub fn finalize(&mut self) -> &str {
        if self.buf.ends_with(',') {
            self.buf.pop();
            self.buf.push(']');
        } else if self.buf == "[" {
            self.buf.push(']');
        }
        &self.buf
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Bytes used, including the opening bracket.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
