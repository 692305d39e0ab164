// ABOUTME: Data structures for the InfluxDB 1.x /query JSON envelope
// ABOUTME: These are deserialized from the HTTP API responses

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::ReplicatorError;

/// Top-level body of a `/query` response.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub results: Vec<StatementResult>,
}

/// Result of one statement inside a `/query` response.
#[derive(Debug, Clone, Deserialize)]
pub struct StatementResult {
    #[serde(default)]
    pub series: Vec<Series>,
    /// Statement-level error, e.g. "database not found" or a syntax error.
    #[serde(default)]
    pub error: Option<String>,
}

/// One series of tabular data. With `GROUP BY *` the tag set arrives in
/// `tags` and `values` holds the remaining columns, `time` first.
#[derive(Debug, Clone, Deserialize)]
pub struct Series {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
}

/// Kind of a field as reported by `SHOW FIELD KEYS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Numeric,
    String,
    Boolean,
}

impl FieldKind {
    /// Map an Influx field type name. `integer` and `float` collapse into
    /// `Numeric`; unknown types return `None` and the field is dropped.
    pub fn from_influx_type(t: &str) -> Option<FieldKind> {
        match t {
            "integer" | "float" => Some(FieldKind::Numeric),
            "string" => Some(FieldKind::String),
            "boolean" => Some(FieldKind::Boolean),
            _ => None,
        }
    }
}

/// A field name together with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

/// Parse a timestamp as returned by InfluxDB: RFC 3339 with second or
/// nanosecond precision.
pub fn parse_influx_timestamp(s: &str) -> Result<DateTime<Utc>, ReplicatorError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ReplicatorError::Data(format!("unparseable timestamp '{}': {}", s, e)))
}
