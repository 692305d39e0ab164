// ABOUTME: Per-chunk transfer engine: query, rewrite, and write one window
// ABOUTME: Splits fields by kind, merges rows, drops non-finite cells, retries

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::ReplicatorError;
use crate::influx::models::parse_influx_timestamp;
use crate::influx::{encode_point, quote_ident, FieldDef, FieldKind, FieldValue, InfluxClient, Series};

/// Maximum number of points per write request.
const WRITE_BATCH_SIZE: usize = 5_000;

/// Counters for one transferred chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkStats {
    pub rows_read: u64,
    pub points_written: u64,
    pub non_finite_dropped: u64,
}

impl ChunkStats {
    pub fn absorb(&mut self, other: ChunkStats) {
        self.rows_read += other.rows_read;
        self.points_written += other.points_written;
        self.non_finite_dropped += other.non_finite_dropped;
    }
}

/// One output row keyed by (timestamp, tag set).
#[derive(Debug)]
struct PointRow {
    time: DateTime<Utc>,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
}

type PointKey = (i64, Vec<(String, String)>);

/// Moves the data of one (measurement, chunk) pair from source to
/// destination.
pub struct TransferEngine<'a> {
    pub source: &'a InfluxClient,
    pub dest: &'a InfluxClient,
    pub group_by: String,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl<'a> TransferEngine<'a> {
    /// Copy `[t0, t1)` of one measurement. Returns the chunk counters, or
    /// the error that survived all retries.
    pub async fn transfer_chunk(
        &self,
        source_db: &str,
        dest_db: &str,
        measurement: &str,
        fields: &[FieldDef],
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<ChunkStats, ReplicatorError> {
        let mut stats = ChunkStats::default();
        let mut merged: BTreeMap<PointKey, PointRow> = BTreeMap::new();

        for statement in build_chunk_queries(measurement, fields, t0, t1, &self.group_by) {
            let series = match self.query_with_retry(source_db, &statement).await {
                Ok(series) => series,
                Err(ReplicatorError::Data(msg)) => {
                    // Malformed payloads degrade to an empty result.
                    tracing::warn!(measurement, error = %msg, "Substituting empty result");
                    Vec::new()
                }
                Err(e) => return Err(e),
            };
            collect_points(&series, &mut merged, &mut stats);
        }

        if stats.non_finite_dropped > 0 {
            tracing::warn!(
                measurement,
                skipped = stats.non_finite_dropped,
                "Skipped non-finite numeric cells"
            );
        }

        if merged.is_empty() {
            tracing::debug!(
                measurement,
                from = %t0.to_rfc3339(),
                to = %t1.to_rfc3339(),
                "No points in window"
            );
            return Ok(stats);
        }

        let mut lines = Vec::with_capacity(merged.len());
        for row in merged.values() {
            match row.time.timestamp_nanos_opt() {
                Some(ns) => lines.push(encode_point(measurement, &row.tags, &row.fields, ns)),
                None => {
                    tracing::warn!(
                        measurement,
                        time = %row.time.to_rfc3339(),
                        "Timestamp outside the nanosecond range, point skipped"
                    );
                }
            }
        }

        self.write_with_retry(dest_db, &lines).await?;
        stats.points_written = lines.len() as u64;

        tracing::info!(
            measurement,
            from = %t0.to_rfc3339(),
            to = %t1.to_rfc3339(),
            rows = stats.rows_read,
            written = stats.points_written,
            "Chunk transferred"
        );

        Ok(stats)
    }

    async fn query_with_retry(
        &self,
        db: &str,
        statement: &str,
    ) -> Result<Vec<Series>, ReplicatorError> {
        let mut attempt = 1;
        loop {
            match self.source.query_series(db, statement).await {
                Ok(series) => return Ok(series),
                Err(e) if e.is_transient() && attempt <= self.retries => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.retries + 1,
                        error = %e,
                        "Query failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_with_retry(
        &self,
        db: &str,
        lines: &[String],
    ) -> Result<(), ReplicatorError> {
        let mut attempt = 1;
        loop {
            match self.dest.write_points(db, lines, WRITE_BATCH_SIZE).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt <= self.retries => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.retries + 1,
                        error = %e,
                        "Write failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Build the read statements for one chunk: at most two, one per field
/// kind group. With aggregation disabled a single raw query covers all
/// fields.
fn build_chunk_queries(
    measurement: &str,
    fields: &[FieldDef],
    t0: DateTime<Utc>,
    t1: DateTime<Utc>,
    group_by: &str,
) -> Vec<String> {
    let window = format!(
        "WHERE time >= '{}' AND time < '{}'",
        t0.to_rfc3339_opts(SecondsFormat::Nanos, true),
        t1.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );

    if group_by.is_empty() {
        let select = fields
            .iter()
            .map(|f| quote_ident(&f.name))
            .collect::<Vec<_>>()
            .join(", ");
        return vec![format!(
            "SELECT {} FROM {} {} GROUP BY *",
            select,
            quote_ident(measurement),
            window
        )];
    }

    let (numeric, other): (Vec<&FieldDef>, Vec<&FieldDef>) =
        fields.iter().partition(|f| f.kind == FieldKind::Numeric);

    let mut queries = Vec::with_capacity(2);
    for (group, func) in [(numeric, "mean"), (other, "last")] {
        if group.is_empty() {
            continue;
        }
        let select = group
            .iter()
            .map(|f| {
                format!(
                    "{}({}) AS {}",
                    func,
                    quote_ident(&f.name),
                    quote_ident(&format!("{}_{}", func, f.name))
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        queries.push(format!(
            "SELECT {} FROM {} {} GROUP BY time({}), * fill(none)",
            select,
            quote_ident(measurement),
            window,
            group_by
        ));
    }
    queries
}

/// Remove the aggregation prefix a column picked up from `mean()`/`last()`.
fn strip_aggregation_prefix(column: &str) -> &str {
    column
        .strip_prefix("mean_")
        .or_else(|| column.strip_prefix("last_"))
        .unwrap_or(column)
}

/// Fold series rows into the merge map, keyed on (timestamp, tag set).
fn collect_points(
    series_list: &[Series],
    merged: &mut BTreeMap<PointKey, PointRow>,
    stats: &mut ChunkStats,
) {
    let mut malformed_rows = 0u64;

    for series in series_list {
        let tag_key: Vec<(String, String)> = series
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for row in &series.values {
            let time = match row
                .first()
                .and_then(|v| v.as_str())
                .map(parse_influx_timestamp)
            {
                Some(Ok(t)) => t,
                _ => {
                    malformed_rows += 1;
                    continue;
                }
            };
            stats.rows_read += 1;

            let mut cells = BTreeMap::new();
            for (column, cell) in series.columns.iter().zip(row.iter()).skip(1) {
                let name = strip_aggregation_prefix(column);
                if let Some(value) = cell_value(cell, &mut stats.non_finite_dropped) {
                    cells.insert(name.to_string(), value);
                }
            }
            if cells.is_empty() {
                continue;
            }

            let key = (
                time.timestamp_nanos_opt().unwrap_or(i64::MAX),
                tag_key.clone(),
            );
            merged
                .entry(key)
                .or_insert_with(|| PointRow {
                    time,
                    tags: series.tags.clone(),
                    fields: BTreeMap::new(),
                })
                .fields
                .extend(cells);
        }
    }

    if malformed_rows > 0 {
        tracing::warn!(rows = malformed_rows, "Dropped rows without a usable timestamp");
    }
}

/// Convert one JSON cell into a field value. Null cells and non-finite
/// numbers yield `None`; the latter bump the skip counter.
fn cell_value(cell: &serde_json::Value, non_finite: &mut u64) -> Option<FieldValue> {
    match cell {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(FieldValue::Boolean(*b)),
        serde_json::Value::String(s) => Some(FieldValue::String(s.clone())),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(FieldValue::Integer(i))
            } else {
                numeric_cell(n.as_f64()?, non_finite)
            }
        }
        _ => None,
    }
}

fn numeric_cell(f: f64, non_finite: &mut u64) -> Option<FieldValue> {
    if f.is_finite() {
        Some(FieldValue::Float(f))
    } else {
        *non_finite += 1;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    fn field(name: &str, kind: FieldKind) -> FieldDef {
        FieldDef {
            name: name.to_string(),
            kind,
        }
    }

    #[test]
    fn test_build_queries_splits_by_kind() {
        let fields = vec![
            field("usage", FieldKind::Numeric),
            field("status", FieldKind::String),
            field("up", FieldKind::Boolean),
        ];
        let queries = build_chunk_queries(
            "cpu",
            &fields,
            ts("2024-01-01T00:00:00Z"),
            ts("2024-01-08T00:00:00Z"),
            "5m",
        );
        assert_eq!(queries.len(), 2);
        assert_eq!(
            queries[0],
            "SELECT mean(\"usage\") AS \"mean_usage\" FROM \"cpu\" \
             WHERE time >= '2024-01-01T00:00:00.000000000Z' AND time < '2024-01-08T00:00:00.000000000Z' \
             GROUP BY time(5m), * fill(none)"
        );
        assert!(queries[1].contains("last(\"status\") AS \"last_status\""));
        assert!(queries[1].contains("last(\"up\") AS \"last_up\""));
    }

    #[test]
    fn test_build_queries_numeric_only_is_single_statement() {
        let fields = vec![field("usage", FieldKind::Numeric)];
        let queries = build_chunk_queries(
            "cpu",
            &fields,
            ts("2024-01-01T00:00:00Z"),
            ts("2024-01-02T00:00:00Z"),
            "1h",
        );
        assert_eq!(queries.len(), 1);
        assert!(queries[0].starts_with("SELECT mean"));
    }

    #[test]
    fn test_build_queries_raw_when_aggregation_disabled() {
        let fields = vec![
            field("usage", FieldKind::Numeric),
            field("status", FieldKind::String),
        ];
        let queries = build_chunk_queries(
            "cpu",
            &fields,
            ts("2024-01-01T00:00:00Z"),
            ts("2024-01-02T00:00:00Z"),
            "",
        );
        assert_eq!(queries.len(), 1);
        assert_eq!(
            queries[0],
            "SELECT \"usage\", \"status\" FROM \"cpu\" \
             WHERE time >= '2024-01-01T00:00:00.000000000Z' AND time < '2024-01-02T00:00:00.000000000Z' \
             GROUP BY *"
        );
    }

    #[test]
    fn test_strip_aggregation_prefix() {
        assert_eq!(strip_aggregation_prefix("mean_usage"), "usage");
        assert_eq!(strip_aggregation_prefix("last_status"), "status");
        assert_eq!(strip_aggregation_prefix("usage"), "usage");
    }

    #[test]
    fn test_cell_value_drops_non_finite() {
        let mut dropped = 0;
        assert_eq!(
            numeric_cell(1.5, &mut dropped),
            Some(FieldValue::Float(1.5))
        );
        assert_eq!(numeric_cell(f64::NAN, &mut dropped), None);
        assert_eq!(numeric_cell(f64::INFINITY, &mut dropped), None);
        assert_eq!(numeric_cell(f64::NEG_INFINITY, &mut dropped), None);
        assert_eq!(dropped, 3);
    }

    #[test]
    fn test_cell_value_kinds() {
        let mut dropped = 0;
        assert_eq!(
            cell_value(&json!(2), &mut dropped),
            Some(FieldValue::Integer(2))
        );
        assert_eq!(
            cell_value(&json!(2.5), &mut dropped),
            Some(FieldValue::Float(2.5))
        );
        assert_eq!(
            cell_value(&json!("ok"), &mut dropped),
            Some(FieldValue::String("ok".into()))
        );
        assert_eq!(
            cell_value(&json!(true), &mut dropped),
            Some(FieldValue::Boolean(true))
        );
        assert_eq!(cell_value(&json!(null), &mut dropped), None);
        assert_eq!(dropped, 0);
    }

    fn series(
        tags: &[(&str, &str)],
        columns: &[&str],
        values: Vec<Vec<serde_json::Value>>,
    ) -> Series {
        Series {
            name: "cpu".to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            values,
        }
    }

    #[test]
    fn test_collect_points_merges_kind_queries_on_time_and_tags() {
        let numeric = series(
            &[("host", "a")],
            &["time", "mean_usage"],
            vec![vec![json!("2024-01-01T00:00:00Z"), json!(0.5)]],
        );
        let textual = series(
            &[("host", "a")],
            &["time", "last_status"],
            vec![vec![json!("2024-01-01T00:00:00Z"), json!("ok")]],
        );

        let mut merged = BTreeMap::new();
        let mut stats = ChunkStats::default();
        collect_points(&[numeric], &mut merged, &mut stats);
        collect_points(&[textual], &mut merged, &mut stats);

        assert_eq!(merged.len(), 1);
        let row = merged.values().next().expect("row");
        assert_eq!(row.fields.get("usage"), Some(&FieldValue::Float(0.5)));
        assert_eq!(
            row.fields.get("status"),
            Some(&FieldValue::String("ok".into()))
        );
        assert_eq!(stats.rows_read, 2);
    }

    #[test]
    fn test_collect_points_keeps_tagsets_apart() {
        let a = series(
            &[("host", "a")],
            &["time", "mean_usage"],
            vec![vec![json!("2024-01-01T00:00:00Z"), json!(0.1)]],
        );
        let b = series(
            &[("host", "b")],
            &["time", "mean_usage"],
            vec![vec![json!("2024-01-01T00:00:00Z"), json!(0.2)]],
        );

        let mut merged = BTreeMap::new();
        let mut stats = ChunkStats::default();
        collect_points(&[a, b], &mut merged, &mut stats);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_collect_points_drops_all_null_rows() {
        let s = series(
            &[],
            &["time", "mean_usage"],
            vec![
                vec![json!("2024-01-01T00:00:00Z"), json!(null)],
                vec![json!("2024-01-01T00:05:00Z"), json!(1.0)],
            ],
        );
        let mut merged = BTreeMap::new();
        let mut stats = ChunkStats::default();
        collect_points(&[s], &mut merged, &mut stats);
        assert_eq!(merged.len(), 1);
        assert_eq!(stats.rows_read, 2);
    }

    #[test]
    fn test_collect_points_orders_by_time() {
        let s = series(
            &[],
            &["time", "usage"],
            vec![
                vec![json!("2024-01-01T00:10:00Z"), json!(3.0)],
                vec![json!("2024-01-01T00:00:00Z"), json!(1.0)],
                vec![json!("2024-01-01T00:05:00Z"), json!(2.0)],
            ],
        );
        let mut merged = BTreeMap::new();
        let mut stats = ChunkStats::default();
        collect_points(&[s], &mut merged, &mut stats);

        let times: Vec<_> = merged.values().map(|r| r.time).collect();
        assert_eq!(
            times,
            vec![
                ts("2024-01-01T00:00:00Z"),
                ts("2024-01-01T00:05:00Z"),
                ts("2024-01-01T00:10:00Z"),
            ]
        );
    }
}
