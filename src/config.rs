// ABOUTME: YAML job configuration: loading, validation, dotted-path lookup
// ABOUTME: Materializes the typed Job consumed by the planner and engine

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::ReplicatorError;
use crate::influx::FieldKind;
use crate::plan::parse_duration;
use crate::scheduler::parse_cron;

const DEFAULT_GROUP_BY: &str = "5m";
const DEFAULT_CHUNK_DAYS: i64 = 7;
const DEFAULT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
const DEFAULT_FALLBACK_DAYS: i64 = 30;
const DEFAULT_OBSOLETE_DAYS: i64 = 30;

/// One loaded YAML document. The raw tree is retained so option lookup
/// follows the default-on-missing contract for any dotted path.
#[derive(Debug)]
pub struct Config {
    raw: serde_yaml::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Range,
    Incremental,
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub user: String,
    pub password: String,
}

/// A source database paired with the destination it replicates into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseMapping {
    pub source: String,
    pub destination: String,
}

/// Field selection policy: restrict to `types`, apply `include` when
/// non-empty, then remove `exclude`.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldPolicy {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "all_field_kinds")]
    pub types: Vec<FieldKind>,
}

fn all_field_kinds() -> Vec<FieldKind> {
    vec![FieldKind::Numeric, FieldKind::String, FieldKind::Boolean]
}

impl Default for FieldPolicy {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            types: all_field_kinds(),
        }
    }
}

/// Measurement-level filtering: name include/exclude plus the global field
/// policy and per-measurement overrides. The override block wins.
#[derive(Debug, Clone, Default)]
pub struct MeasurementFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub fields: FieldPolicy,
    pub specific: BTreeMap<String, FieldPolicy>,
}

impl MeasurementFilter {
    pub fn field_policy(&self, measurement: &str) -> &FieldPolicy {
        self.specific.get(measurement).unwrap_or(&self.fields)
    }
}

/// One job, immutable after load.
#[derive(Debug, Clone)]
pub struct Job {
    pub source: Endpoint,
    pub destination: Endpoint,
    /// Empty means "all source databases except `_internal`", expanded at
    /// runtime with `db_prefix`/`db_suffix`.
    pub databases: Vec<DatabaseMapping>,
    pub db_prefix: String,
    pub db_suffix: String,
    pub group_by: String,
    pub filter: MeasurementFilter,
    pub mode: Mode,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub backup_period: Option<chrono::Duration>,
    pub chunk_days: i64,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub fallback_days: i64,
    pub schedule: Option<String>,
    pub obsolete_days: i64,
    pub log_level: String,
}

/// Entry of the `source.databases` list as written in YAML.
#[derive(Debug, Clone, Deserialize)]
struct DatabaseEntry {
    name: String,
    destination: Option<String>,
    prefix: Option<String>,
    suffix: Option<String>,
}

/// Wrapper for `measurements.specific.<name>` blocks.
#[derive(Debug, Clone, Deserialize)]
struct SpecificEntry {
    #[serde(default)]
    fields: FieldPolicy,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ReplicatorError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReplicatorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ReplicatorError> {
        let raw: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| ReplicatorError::Config(format!("invalid YAML: {}", e)))?;

        let config = Self { raw };
        for section in ["source", "destination", "options"] {
            if config.raw.get(section).is_none() {
                return Err(ReplicatorError::Config(format!(
                    "required section '{}' is missing",
                    section
                )));
            }
        }
        Ok(config)
    }

    /// Dotted-path lookup with a default on missing or mismatched values,
    /// e.g. `get("options.incremental.fallback_days", 30)`.
    pub fn get<T: DeserializeOwned>(&self, path: &str, default: T) -> T {
        self.get_opt(path).unwrap_or(default)
    }

    pub fn get_opt<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        let mut value = &self.raw;
        for key in path.split('.') {
            value = value.get(key)?;
        }
        serde_yaml::from_value(value.clone()).ok()
    }

    /// Validate the document and build the immutable job view.
    pub fn job(&self) -> Result<Job, ReplicatorError> {
        let source = self.endpoint("source")?;
        let destination = self.endpoint("destination")?;

        let mode = match self.get::<String>("options.mode", "incremental".into()).as_str() {
            "range" => Mode::Range,
            "incremental" => Mode::Incremental,
            other => {
                return Err(ReplicatorError::Config(format!(
                    "options.mode must be 'range' or 'incremental', got '{}'",
                    other
                )))
            }
        };

        let start_date = self.date_option("options.start_date")?;
        let end_date = self.date_option("options.end_date")?;
        let backup_period = self
            .get_opt::<String>("options.backup_period")
            .map(|s| parse_duration(&s))
            .transpose()?;

        if mode == Mode::Range {
            if start_date.is_none() {
                return Err(ReplicatorError::Config(
                    "range mode requires options.start_date".into(),
                ));
            }
            if end_date.is_none() && backup_period.is_none() {
                return Err(ReplicatorError::Config(
                    "range mode requires options.end_date or options.backup_period".into(),
                ));
            }
        }

        let chunk_days = self.get_opt::<i64>("options.chunk_days").unwrap_or_else(|| {
            self.get("options.days_of_pagination", DEFAULT_CHUNK_DAYS)
        });
        if chunk_days < 1 {
            return Err(ReplicatorError::Config(format!(
                "options.chunk_days must be >= 1, got {}",
                chunk_days
            )));
        }

        let group_by = self.get("source.group_by", DEFAULT_GROUP_BY.to_string());
        if group_by.is_empty() && chunk_days > 1 {
            return Err(ReplicatorError::Config(
                "an empty source.group_by disables aggregation; options.chunk_days must be 1"
                    .into(),
            ));
        }

        let schedule = self.get_opt::<String>("options.incremental.schedule");
        if let Some(expr) = &schedule {
            parse_cron(expr)?;
        }

        let log_level = self.get("options.log_level", "INFO".to_string());
        if !matches!(
            log_level.as_str(),
            "DEBUG" | "INFO" | "WARNING" | "ERROR" | "CRITICAL"
        ) {
            return Err(ReplicatorError::Config(format!(
                "unknown options.log_level '{}'",
                log_level
            )));
        }

        let db_prefix = self.get("source.prefix", String::new());
        let db_suffix = self.get("source.suffix", String::new());
        let databases = self.database_mappings(&db_prefix, &db_suffix)?;

        let specific = self
            .get_opt::<BTreeMap<String, SpecificEntry>>("measurements.specific")
            .unwrap_or_default()
            .into_iter()
            .map(|(name, entry)| (name, entry.fields))
            .collect();

        let filter = MeasurementFilter {
            include: self.get("measurements.include", Vec::new()),
            exclude: self.get("measurements.exclude", Vec::new()),
            fields: self.get("measurements.fields", FieldPolicy::default()),
            specific,
        };

        Ok(Job {
            source,
            destination,
            databases,
            db_prefix,
            db_suffix,
            group_by,
            filter,
            mode,
            start_date,
            end_date,
            backup_period,
            chunk_days,
            timeout: Duration::from_secs(self.get("options.timeout_client", DEFAULT_TIMEOUT_SECS)),
            retries: self.get("options.retries", DEFAULT_RETRIES),
            retry_delay: Duration::from_secs(
                self.get("options.retry_delay", DEFAULT_RETRY_DELAY_SECS),
            ),
            fallback_days: self.get("options.incremental.fallback_days", DEFAULT_FALLBACK_DAYS),
            schedule,
            obsolete_days: self.get("options.obsolete_days", DEFAULT_OBSOLETE_DAYS),
            log_level,
        })
    }

    fn endpoint(&self, section: &str) -> Result<Endpoint, ReplicatorError> {
        let url: String = self.get(&format!("{}.url", section), String::new());
        if url.is_empty() {
            return Err(ReplicatorError::Config(format!(
                "{}.url is required",
                section
            )));
        }
        Ok(Endpoint {
            url,
            user: self.get(&format!("{}.user", section), String::new()),
            password: self.get(&format!("{}.password", section), String::new()),
        })
    }

    fn date_option(&self, path: &str) -> Result<Option<DateTime<Utc>>, ReplicatorError> {
        match self.get_opt::<String>(path) {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| {
                    ReplicatorError::Config(format!("{} is not RFC 3339 ('{}'): {}", path, raw, e))
                }),
        }
    }

    fn database_mappings(
        &self,
        global_prefix: &str,
        global_suffix: &str,
    ) -> Result<Vec<DatabaseMapping>, ReplicatorError> {
        let entries = self
            .get_opt::<Vec<DatabaseEntry>>("source.databases")
            .unwrap_or_default();

        let mut mappings = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.name.is_empty() {
                return Err(ReplicatorError::Config(
                    "source.databases entries require a non-empty name".into(),
                ));
            }
            let destination = entry.destination.clone().unwrap_or_else(|| {
                derive_destination(
                    &entry.name,
                    entry.prefix.as_deref().unwrap_or(global_prefix),
                    entry.suffix.as_deref().unwrap_or(global_suffix),
                )
            });
            mappings.push(DatabaseMapping {
                source: entry.name,
                destination,
            });
        }
        Ok(mappings)
    }
}

/// Destination name for an auto-derived mapping.
pub fn derive_destination(name: &str, prefix: &str, suffix: &str) -> String {
    format!("{}{}{}", prefix, name, suffix)
}

/// Template configurations are skipped by the orchestrator.
pub fn is_template_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".template.yaml") || n.ends_with(".template.yml"))
        .unwrap_or(false)
}
