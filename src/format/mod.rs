// ============================================================================
// SECTION 1: OUTPUT FORMATS
// ============================================================================
// Text renderings of value lists and notifications for writer plugins.
// Escaping is shared: every formatter replaces the same forbidden
// characters with a single escape character and may forbid more.
// ============================================================================

pub mod alert;
pub mod graphite;
pub mod json;

use std::borrow::Cow;

use thiserror::Error;

use crate::error::CollectdError;

pub use alert::format_alert;
pub use graphite::{GraphiteFormatter, GraphiteOptions};
pub use json::JsonBuffer;

// ----------------------------------------------------------------------------
// 1.1 Escaping
// ----------------------------------------------------------------------------

/// Characters no formatter lets through.
pub const FORBIDDEN: &[char] = &[' ', '\t', '"', '\\', ':', '!', '/', '(', ')', '\r', '\n'];

pub const DEFAULT_ESCAPE_CHAR: char = '_';

#[inline]
fn is_forbidden(c: char, extra: &[char]) -> bool {
    FORBIDDEN.contains(&c) || extra.contains(&c) || c.is_whitespace() || c.is_control()
}

/// Replace every forbidden character (plus `extra`) with `escape`. Borrows
/// when nothing needs replacing.
pub fn escape_field<'a>(field: &'a str, extra: &[char], escape: char) -> Cow<'a, str> {
    if !field.chars().any(|c| is_forbidden(c, extra)) {
        return Cow::Borrowed(field);
    }
    Cow::Owned(
        field
            .chars()
            .map(|c| if is_forbidden(c, extra) { escape } else { c })
            .collect(),
    )
}

// ----------------------------------------------------------------------------
// 1.2 Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum FormatError {
    /// The record does not fit; flush and retry.
    #[error("buffer full: {needed} bytes needed, {available} available")]
    BufferFull { needed: usize, available: usize },

    #[error("value list {identifier} does not match data set '{type_name}'")]
    Mismatch { identifier: String, type_name: String },

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<FormatError> for CollectdError {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::BufferFull { .. } => CollectdError::out_of_memory(err.to_string()),
            other => CollectdError::invariant(other.to_string()),
        }
    }
}

/// Gauges render in their shortest exact form; NaN renders as `nan`.
pub(crate) fn format_gauge(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else {
        format!("{}", v)
    }
}

// ============================================================================
// SECTION 2: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("eth0", "eth0" ; "untouched")]
    #[test_case("a b", "a_b" ; "space")]
    #[test_case("C:\\temp", "C__temp" ; "colon and backslash")]
    #[test_case("fn(x)!", "fn_x__" ; "parens and bang")]
    #[test_case("line\r\n", "line__" ; "crlf")]
    #[test_case("/var/log", "_var_log" ; "slashes")]
    fn test_shared_escapes(input: &str, expected: &str) {
        assert_eq!(escape_field(input, &[], '_'), expected);
    }

    #[test]
    fn test_extra_characters_and_borrowing() {
        assert_eq!(escape_field("a.b", &['.'], '-'), "a-b");
        assert!(matches!(escape_field("a.b", &[], '-'), Cow::Borrowed(_)));
    }

    #[test]
    fn test_buffer_full_maps_to_out_of_memory() {
        let err: CollectdError = FormatError::BufferFull { needed: 10, available: 2 }.into();
        assert_eq!(err.category(), "out_of_memory");
    }

    #[test]
    fn test_gauge_rendering() {
        assert_eq!(format_gauge(0.9), "0.9");
        assert_eq!(format_gauge(20.0), "20");
        assert_eq!(format_gauge(f64::NAN), "nan");
    }
}
