// ABOUTME: HTTP client for the InfluxDB 1.x query/write API
// ABOUTME: Maps transport and status failures onto the replicator error kinds

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::Client;

use crate::error::ReplicatorError;
use crate::influx::models::{
    parse_influx_timestamp, FieldDef, FieldKind, QueryResponse, Series,
};

/// Typed wrapper over one InfluxDB endpoint.
///
/// Holds a single connection pool; the database context is passed per call
/// as the `db` query parameter.
pub struct InfluxClient {
    client: Client,
    base_url: String,
    user: String,
    password: String,
}

impl InfluxClient {
    pub fn new(
        url: &str,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, ReplicatorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")
            .map_err(|e| ReplicatorError::Config(format!("{:#}", e)))?;

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.base_url
    }

    fn auth_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if !self.user.is_empty() {
            params.push(("u", self.user.clone()));
            params.push(("p", self.password.clone()));
        }
        params
    }

    /// Verify reachability. Returns the server version when the endpoint
    /// reports one in the `X-Influxdb-Version` header.
    pub async fn ping(&self) -> Result<Option<String>, ReplicatorError> {
        let url = format!("{}/ping", self.base_url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            ReplicatorError::Connection(format!("cannot reach {}: {}", self.base_url, e))
        })?;

        if !response.status().is_success() {
            return Err(ReplicatorError::Connection(format!(
                "ping of {} returned status {}",
                self.base_url,
                response.status()
            )));
        }

        let version = response
            .headers()
            .get("X-Influxdb-Version")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        Ok(version)
    }

    /// Execute one InfluxQL statement via `POST /query`.
    async fn query(
        &self,
        db: Option<&str>,
        statement: &str,
    ) -> Result<QueryResponse, ReplicatorError> {
        let url = format!("{}/query", self.base_url);

        let mut params = vec![("q", statement.to_string())];
        if let Some(db) = db {
            params.push(("db", db.to_string()));
        }
        params.extend(self.auth_params());

        tracing::debug!(db = ?db, statement, "Executing query");

        let response = self
            .client
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_to_error(status.as_u16(), &body));
        }

        let parsed: QueryResponse = response.json().await.map_err(|e| {
            ReplicatorError::Data(format!("malformed query response: {}", e))
        })?;

        if let Some(err) = parsed.results.iter().find_map(|r| r.error.as_deref()) {
            return Err(ReplicatorError::Permanent(format!(
                "query rejected: {}",
                err
            )));
        }

        Ok(parsed)
    }

    /// List database names on the endpoint. The internal `_internal`
    /// database is included; callers exclude it.
    pub async fn databases(&self) -> Result<Vec<String>, ReplicatorError> {
        let resp = self.query(None, "SHOW DATABASES").await?;
        Ok(extract_single_string_column(&resp))
    }

    pub async fn measurements(&self, db: &str) -> Result<Vec<String>, ReplicatorError> {
        let resp = self.query(Some(db), "SHOW MEASUREMENTS").await?;
        Ok(extract_single_string_column(&resp))
    }

    /// Field names and kinds for one measurement. Fields with types the
    /// engine cannot carry are dropped.
    pub async fn field_keys(
        &self,
        db: &str,
        measurement: &str,
    ) -> Result<Vec<FieldDef>, ReplicatorError> {
        let statement = format!("SHOW FIELD KEYS FROM {}", quote_ident(measurement));
        let resp = self.query(Some(db), &statement).await?;
        Ok(extract_field_defs(&resp))
    }

    /// Timestamp of the oldest point, restricted to `fields` when non-empty.
    /// Returns `None` for an empty measurement.
    pub async fn first_timestamp(
        &self,
        db: &str,
        measurement: &str,
        fields: &[String],
    ) -> Result<Option<DateTime<Utc>>, ReplicatorError> {
        self.boundary_timestamp(db, measurement, fields, "ASC").await
    }

    /// Timestamp of the newest point, restricted to `fields` when non-empty.
    /// Returns `None` for an empty measurement.
    pub async fn last_timestamp(
        &self,
        db: &str,
        measurement: &str,
        fields: &[String],
    ) -> Result<Option<DateTime<Utc>>, ReplicatorError> {
        self.boundary_timestamp(db, measurement, fields, "DESC").await
    }

    async fn boundary_timestamp(
        &self,
        db: &str,
        measurement: &str,
        fields: &[String],
        order: &str,
    ) -> Result<Option<DateTime<Utc>>, ReplicatorError> {
        let statement = format!(
            "SELECT {} FROM {} ORDER BY time {} LIMIT 1",
            select_clause(fields),
            quote_ident(measurement),
            order
        );
        let resp = self.query(Some(db), &statement).await?;

        match extract_first_timestamp(&resp) {
            Some(raw) => parse_influx_timestamp(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Run a data query and return its series. The caller owns the
    /// statement text; see the transfer engine for the query shapes.
    pub async fn query_series(
        &self,
        db: &str,
        statement: &str,
    ) -> Result<Vec<Series>, ReplicatorError> {
        let resp = self.query(Some(db), statement).await?;
        Ok(resp.results.into_iter().flat_map(|r| r.series).collect())
    }

    /// Create a database if it does not exist. InfluxDB treats the
    /// statement as idempotent.
    pub async fn ensure_database(&self, db: &str) -> Result<(), ReplicatorError> {
        let statement = format!("CREATE DATABASE {}", quote_ident(db));
        self.query(None, &statement).await?;
        Ok(())
    }

    /// Write line protocol lines via `POST /write`, at most `batch_size`
    /// lines per request, default retention policy.
    pub async fn write_points(
        &self,
        db: &str,
        lines: &[String],
        batch_size: usize,
    ) -> Result<(), ReplicatorError> {
        if lines.is_empty() {
            return Ok(());
        }

        let url = format!("{}/write", self.base_url);
        let mut params = vec![("db", db.to_string()), ("precision", "ns".to_string())];
        params.extend(self.auth_params());

        for batch in lines.chunks(batch_size.max(1)) {
            let body = batch.join("\n");

            let response = self
                .client
                .post(&url)
                .query(&params)
                .body(body)
                .send()
                .await
                .map_err(map_send_error)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_to_error(status.as_u16(), &body));
            }
        }

        Ok(())
    }
}

/// Map a reqwest transport failure. Timeouts and resets are retryable.
fn map_send_error(e: reqwest::Error) -> ReplicatorError {
    ReplicatorError::Transient(format!("request failed: {}", e))
}

/// Map a non-2xx status. 5xx is retryable; 4xx other than 404 means the
/// request itself is wrong and will not get better.
fn status_to_error(status: u16, body: &str) -> ReplicatorError {
    let detail = format!("status {}: {}", status, body.trim());
    if status >= 500 || status == 404 {
        ReplicatorError::Transient(detail)
    } else {
        ReplicatorError::Permanent(detail)
    }
}

/// Quote an InfluxQL identifier (database, measurement, field name).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\\\""))
}

fn select_clause(fields: &[String]) -> String {
    if fields.is_empty() {
        "*".to_string()
    } else {
        fields
            .iter()
            .map(|f| quote_ident(f))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Pull the values of a single-column series, as returned by
/// `SHOW DATABASES` and `SHOW MEASUREMENTS`.
fn extract_single_string_column(resp: &QueryResponse) -> Vec<String> {
    resp.results
        .iter()
        .flat_map(|r| &r.series)
        .flat_map(|s| &s.values)
        .filter_map(|row| row.first().and_then(|v| v.as_str()).map(String::from))
        .collect()
}

/// Pull `[fieldKey, fieldType]` rows from a `SHOW FIELD KEYS` response.
fn extract_field_defs(resp: &QueryResponse) -> Vec<FieldDef> {
    resp.results
        .iter()
        .flat_map(|r| &r.series)
        .flat_map(|s| &s.values)
        .filter_map(|row| {
            let name = row.first().and_then(|v| v.as_str())?;
            let kind = row
                .get(1)
                .and_then(|v| v.as_str())
                .and_then(FieldKind::from_influx_type)?;
            Some(FieldDef {
                name: name.to_string(),
                kind,
            })
        })
        .collect()
}

/// Pull the `time` cell of the first row of the first series.
fn extract_first_timestamp(resp: &QueryResponse) -> Option<String> {
    resp.results
        .iter()
        .flat_map(|r| &r.series)
        .flat_map(|s| &s.values)
        .next()
        .and_then(|row| row.first())
        .and_then(|v| v.as_str())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation_trims_trailing_slash() {
        let client = InfluxClient::new(
            "http://localhost:8086/",
            "",
            "",
            Duration::from_secs(20),
        )
        .expect("client");
        assert_eq!(client.url(), "http://localhost:8086");
    }

    #[test]
    fn test_auth_params_empty_user_sends_nothing() {
        let client =
            InfluxClient::new("http://localhost:8086", "", "", Duration::from_secs(1))
                .expect("client");
        assert!(client.auth_params().is_empty());

        let client =
            InfluxClient::new("http://localhost:8086", "admin", "s3cret", Duration::from_secs(1))
                .expect("client");
        assert_eq!(
            client.auth_params(),
            vec![("u", "admin".to_string()), ("p", "s3cret".to_string())]
        );
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_to_error(503, "unavailable"),
            ReplicatorError::Transient(_)
        ));
        assert!(matches!(
            status_to_error(404, ""),
            ReplicatorError::Transient(_)
        ));
        assert!(matches!(
            status_to_error(400, "bad query"),
            ReplicatorError::Permanent(_)
        ));
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("cpu"), "\"cpu\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\\\"ird\"");
    }

    #[test]
    fn test_select_clause() {
        assert_eq!(select_clause(&[]), "*");
        assert_eq!(
            select_clause(&["a".to_string(), "b".to_string()]),
            "\"a\", \"b\""
        );
    }

    #[test]
    fn test_extract_databases() {
        let body = r#"{
            "results": [{
                "series": [{
                    "name": "databases",
                    "columns": ["name"],
                    "values": [["telegraf"], ["ops"], ["_internal"]]
                }]
            }]
        }"#;
        let resp: QueryResponse = serde_json::from_str(body).expect("deserialize");
        assert_eq!(
            extract_single_string_column(&resp),
            vec!["telegraf", "ops", "_internal"]
        );
    }

    #[test]
    fn test_extract_field_defs_drops_unknown_types() {
        let body = r#"{
            "results": [{
                "series": [{
                    "name": "cpu",
                    "columns": ["fieldKey", "fieldType"],
                    "values": [
                        ["usage", "float"],
                        ["count", "integer"],
                        ["status", "string"],
                        ["up", "boolean"],
                        ["raw", "blob"]
                    ]
                }]
            }]
        }"#;
        let resp: QueryResponse = serde_json::from_str(body).expect("deserialize");
        let defs = extract_field_defs(&resp);
        assert_eq!(defs.len(), 4);
        assert_eq!(defs[0].name, "usage");
        assert_eq!(defs[0].kind, FieldKind::Numeric);
        assert_eq!(defs[3].kind, FieldKind::Boolean);
    }

    #[test]
    fn test_extract_first_timestamp_empty_measurement() {
        let body = r#"{"results": [{}]}"#;
        let resp: QueryResponse = serde_json::from_str(body).expect("deserialize");
        assert!(extract_first_timestamp(&resp).is_none());
    }
}
