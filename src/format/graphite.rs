//! Graphite plaintext protocol: one `<name> <value> <epoch>\r\n` line per
//! data source.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::{escape_field, format_gauge, FormatError, DEFAULT_ESCAPE_CHAR};
use crate::types::{DataSet, DsType, Value, ValueList};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphiteOptions {
    /// Prepended to the host segment
    pub prefix: String,
    /// Appended to the host segment
    pub postfix: String,
    pub escape_char: char,
    /// Join instances with `.` instead of `-`
    pub separate_instances: bool,
    /// Append the data source name even for single-source data sets
    pub always_append_ds: bool,
    /// Keep dots inside fields
    pub preserve_separator: bool,
    /// Collapse identical consecutive path segments
    pub drop_duplicate_fields: bool,
}

impl Default for GraphiteOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            postfix: String::new(),
            escape_char: DEFAULT_ESCAPE_CHAR,
            separate_instances: false,
            always_append_ds: false,
            preserve_separator: false,
            drop_duplicate_fields: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphiteFormatter {
    options: GraphiteOptions,
}

impl GraphiteFormatter {
    pub fn new(options: GraphiteOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &GraphiteOptions {
        &self.options
    }

    fn escape<'a>(&self, field: &'a str) -> std::borrow::Cow<'a, str> {
        let extra: &[char] = if self.options.preserve_separator { &[] } else { &['.'] };
        escape_field(field, extra, self.options.escape_char)
    }

    /// Metric path of one data source; `ds_name` is appended when given.
    pub fn metric_name(&self, vl: &ValueList, ds_name: Option<&str>) -> String {
        let opts = &self.options;
        let sep = if opts.separate_instances { '.' } else { '-' };
        let id = &vl.identifier;

        let mut name = String::with_capacity(64);
        name.push_str(&opts.prefix);
        name.push_str(&self.escape(&id.host));
        name.push_str(&opts.postfix);
        name.push('.');
        name.push_str(&self.escape(&id.plugin));
        if !id.plugin_instance.is_empty() {
            name.push(sep);
            name.push_str(&self.escape(&id.plugin_instance));
        }
        name.push('.');
        name.push_str(&self.escape(&id.type_name));
        if !id.type_instance.is_empty() {
            name.push(sep);
            name.push_str(&self.escape(&id.type_instance));
        }
        if let Some(ds_name) = ds_name {
            name.push('.');
            name.push_str(&self.escape(ds_name));
        }

        if opts.drop_duplicate_fields {
            let mut segments: Vec<&str> = name.split('.').collect();
            segments.dedup();
            return segments.join(".");
        }
        name
    }

    /// Render every data source of `vl`. With `rates`, non-gauge sources
    /// are written as their per-second rate.
    pub fn format(&self, ds: &DataSet, vl: &ValueList, rates: Option<&[f64]>) -> Result<String, FormatError> {
        if vl.values.len() != ds.len() || rates.is_some_and(|r| r.len() != ds.len()) {
            return Err(FormatError::Mismatch {
                identifier: vl.identifier.to_string(),
                type_name: ds.type_name.to_string(),
            });
        }

        let epoch = vl.time.whole_secs();
        let mut out = String::new();
        for (i, (source, value)) in ds.sources.iter().zip(&vl.values).enumerate() {
            let ds_name = (self.options.always_append_ds || ds.len() > 1).then_some(source.name.as_str());
            let rendered = match (value, rates) {
                (Value::Gauge(g), _) => format_gauge(*g),
                (_, Some(rates)) if source.ds_type != DsType::Gauge => format_gauge(rates[i]),
                (Value::Counter(v), _) | (Value::Absolute(v), _) => v.to_string(),
                (Value::Derive(v), _) => v.to_string(),
            };
            let _ = write!(out, "{} {} {}\r\n", self.metric_name(vl, ds_name), rendered, epoch);
        }
        Ok(out)
    }
}
