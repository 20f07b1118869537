//! The five-field identifier that routes every sample.
//!
//! Canonical form: `host/plugin[-plugin_instance]/type[-type_instance]`.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::{CollectdError, CollectdResult};

// ============================================================================
// SECTION 1: IDENTIFIER
// ============================================================================

/// Size of an identifier field buffer; the usable length is one less.
pub const DATA_MAX_NAME_LEN: usize = 64;

/// Longest permitted field, in bytes.
pub const MAX_FIELD_LEN: usize = DATA_MAX_NAME_LEN - 1;

/// The catch-all match pattern.
pub const CATCH_ALL: &str = "/.*/";

/// Names one of the five identifier fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Host,
    Plugin,
    PluginInstance,
    Type,
    TypeInstance,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::Host,
        Field::Plugin,
        Field::PluginInstance,
        Field::Type,
        Field::TypeInstance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Host => "host",
            Field::Plugin => "plugin",
            Field::PluginInstance => "plugin_instance",
            Field::Type => "type",
            Field::TypeInstance => "type_instance",
        }
    }
}

/// A fully qualified identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    pub host: CompactString,
    pub plugin: CompactString,
    pub plugin_instance: CompactString,
    #[serde(rename = "type")]
    pub type_name: CompactString,
    pub type_instance: CompactString,
}

impl Identifier {
    pub fn new(
        host: impl Into<CompactString>,
        plugin: impl Into<CompactString>,
        plugin_instance: impl Into<CompactString>,
        type_name: impl Into<CompactString>,
        type_instance: impl Into<CompactString>,
    ) -> Self {
        Self {
            host: host.into(),
            plugin: plugin.into(),
            plugin_instance: plugin_instance.into(),
            type_name: type_name.into(),
            type_instance: type_instance.into(),
        }
    }

    /// Parse the canonical form.
    ///
    /// Splits at the first `/`, then at the next `/`, then at the first `-`
    /// of each of the two trailing segments.
    pub fn parse(s: &str) -> CollectdResult<Self> {
        let (host, rest) = s
            .split_once('/')
            .ok_or_else(|| invalid(s, "missing '/' after host"))?;
        let (plugin_part, type_part) = rest
            .split_once('/')
            .ok_or_else(|| invalid(s, "missing '/' after plugin"))?;

        let (plugin, plugin_instance) = plugin_part.split_once('-').unwrap_or((plugin_part, ""));
        let (type_name, type_instance) = type_part.split_once('-').unwrap_or((type_part, ""));

        if plugin.is_empty() {
            return Err(invalid(s, "empty plugin"));
        }
        if type_name.is_empty() {
            return Err(invalid(s, "empty type"));
        }

        let ident = Self::new(host, plugin, plugin_instance, type_name, type_instance);
        ident.check_lengths()?;
        Ok(ident)
    }

    pub fn field(&self, field: Field) -> &str {
        match field {
            Field::Host => &self.host,
            Field::Plugin => &self.plugin,
            Field::PluginInstance => &self.plugin_instance,
            Field::Type => &self.type_name,
            Field::TypeInstance => &self.type_instance,
        }
    }

    pub fn field_mut(&mut self, field: Field) -> &mut CompactString {
        match field {
            Field::Host => &mut self.host,
            Field::Plugin => &mut self.plugin,
            Field::PluginInstance => &mut self.plugin_instance,
            Field::Type => &mut self.type_name,
            Field::TypeInstance => &mut self.type_instance,
        }
    }

    /// Canonical string form.
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Reject fields that would not fit a field buffer.
    pub fn check_lengths(&self) -> CollectdResult<()> {
        for field in Field::ALL {
            let value = self.field(field);
            if value.len() > MAX_FIELD_LEN {
                return Err(CollectdError::invariant(format!(
                    "{} '{}' exceeds {} bytes",
                    field.as_str(),
                    value,
                    MAX_FIELD_LEN
                )));
            }
        }
        Ok(())
    }

    /// Make every field safe for the slash-separated form: a lone `/` becomes
    /// `root`, a leading `/` is dropped and any other `/` becomes `_`.
    pub fn escape_slashes(&mut self) {
        for field in Field::ALL {
            let value = self.field_mut(field);
            if !value.contains('/') {
                continue;
            }
            *value = escape_slashes(value);
        }
    }
}

fn escape_slashes(value: &str) -> CompactString {
    if value == "/" {
        return CompactString::new("root");
    }
    let trimmed = value.strip_prefix('/').unwrap_or(value);
    trimmed.replace('/', "_").into()
}

fn invalid(s: &str, reason: &str) -> CollectdError {
    CollectdError::invariant(format!("invalid identifier '{}': {}", s, reason))
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.plugin)?;
        if !self.plugin_instance.is_empty() {
            write!(f, "-{}", self.plugin_instance)?;
        }
        write!(f, "/{}", self.type_name)?;
        if !self.type_instance.is_empty() {
            write!(f, "-{}", self.type_instance)?;
        }
        Ok(())
    }
}

impl FromStr for Identifier {
    type Err = CollectdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Identifier::parse(s)
    }
}

// ----------------------------------------------------------------------------
// 1.1 Match Patterns
// ----------------------------------------------------------------------------

/// A field pattern is a regex when it is delimited by slashes and has at
/// least one character between them.
pub fn is_regex_pattern(pattern: &str) -> bool {
    pattern.len() >= 3 && pattern.starts_with('/') && pattern.ends_with('/')
}

/// Strip the delimiting slashes of a regex pattern.
pub fn regex_body(pattern: &str) -> Option<&str> {
    if is_regex_pattern(pattern) {
        Some(&pattern[1..pattern.len() - 1])
    } else {
        None
    }
}

// ============================================================================
// SECTION 2: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn test_parse_full() {
        let ident = Identifier::parse("myhost/cpu-0/cpu-user").unwrap();
        assert_eq!(ident, Identifier::new("myhost", "cpu", "0", "cpu", "user"));
    }

    #[test]
    fn test_parse_splits_at_first_dash() {
        let ident = Identifier::parse("h/disk-sda-1/disk_octets-read-x").unwrap();
        assert_eq!(ident.plugin, "disk");
        assert_eq!(ident.plugin_instance, "sda-1");
        assert_eq!(ident.type_name, "disk_octets");
        assert_eq!(ident.type_instance, "read-x");
    }

    #[test_case("nohost" ; "no slash")]
    #[test_case("host/plugin" ; "one slash")]
    #[test_case("host//type" ; "empty plugin")]
    #[test_case("host/plugin/" ; "empty type")]
    fn test_parse_rejects(input: &str) {
        assert!(Identifier::parse(input).is_err());
    }

    #[test]
    fn test_parse_rejects_long_fields() {
        let long = "x".repeat(MAX_FIELD_LEN + 1);
        assert!(Identifier::parse(&format!("{}/cpu/cpu", long)).is_err());
        let ok = "x".repeat(MAX_FIELD_LEN);
        assert!(Identifier::parse(&format!("{}/cpu/cpu", ok)).is_ok());
    }

    #[test]
    fn test_display_omits_empty_instances() {
        let ident = Identifier::new("h", "load", "", "load", "");
        assert_eq!(ident.to_string(), "h/load/load");
    }

    #[test_case("/", "root")]
    #[test_case("/var/log", "var_log")]
    #[test_case("a/b", "a_b")]
    #[test_case("plain", "plain")]
    fn test_escape_slashes(input: &str, expected: &str) {
        let mut ident = Identifier::new("h", "df", input, "df", "");
        ident.escape_slashes();
        assert_eq!(ident.plugin_instance, expected);
    }

    #[test]
    fn test_regex_pattern_detection() {
        assert!(is_regex_pattern(CATCH_ALL));
        assert!(is_regex_pattern("/^eth/"));
        assert!(!is_regex_pattern("//"));
        assert!(!is_regex_pattern("eth0"));
        assert_eq!(regex_body("/^eth[0-9]$/"), Some("^eth[0-9]$"));
        assert_eq!(regex_body("eth0"), None);
    }

    proptest! {
        #[test]
        fn prop_format_parse_round_trip(
            host in "[a-zA-Z0-9_.]{0,20}",
            plugin in "[a-z0-9_]{1,20}",
            plugin_instance in "[a-z0-9_-]{0,20}",
            type_name in "[a-z0-9_]{1,20}",
            type_instance in "[a-z0-9_.-]{0,20}",
        ) {
            let text = Identifier::new(host, plugin, plugin_instance, type_name, type_instance).to_string();
            let parsed = Identifier::parse(&text).unwrap();
            prop_assert_eq!(parsed.to_string(), text);
        }
    }
}
