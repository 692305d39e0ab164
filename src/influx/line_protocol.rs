// ABOUTME: InfluxDB line protocol encoding for the write path
// ABOUTME: Handles escaping of measurements, tags, field keys and values

use std::collections::BTreeMap;
use std::fmt;

/// A value that can be stored in an InfluxDB field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl FieldValue {
    /// Format this value for line protocol.
    ///
    /// - Float: written as-is (e.g. `3.14`)
    /// - Integer: suffixed with `i` (e.g. `42i`)
    /// - String: double-quoted, inner quotes and backslashes escaped
    /// - Boolean: `true` or `false`
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{}", v),
            FieldValue::Integer(v) => format!("{}i", v),
            FieldValue::String(v) => {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\"", escaped)
            }
            FieldValue::Boolean(v) => {
                if *v {
                    "true".to_string()
                } else {
                    "false".to_string()
                }
            }
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line_protocol())
    }
}

/// Encode one point as a line protocol line with a nanosecond timestamp.
///
/// `fields` must be non-empty; callers filter out empty rows before
/// reaching the write path.
pub fn encode_point(
    measurement: &str,
    tags: &BTreeMap<String, String>,
    fields: &BTreeMap<String, FieldValue>,
    timestamp_ns: i64,
) -> String {
    let mut line = escape_measurement(measurement);

    for (key, value) in tags {
        line.push(',');
        line.push_str(&escape_tag(key));
        line.push('=');
        line.push_str(&escape_tag(value));
    }

    line.push(' ');

    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_tag(key));
        line.push('=');
        line.push_str(&value.to_line_protocol());
    }

    line.push(' ');
    line.push_str(&timestamp_ns.to_string());

    line
}

/// Escape a measurement name. Commas and spaces are escaped.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Escape a tag key, tag value, or field key. Commas, equals signs, and
/// spaces are escaped.
fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
