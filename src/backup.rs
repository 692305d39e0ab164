// ABOUTME: Per-job backup manager
// ABOUTME: Resolves databases, drives the planner, filters, and transfer engine

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::{derive_destination, DatabaseMapping, Job, Mode};
use crate::error::ReplicatorError;
use crate::filter::{active_fields, filter_measurements, select_fields};
use crate::influx::{FieldDef, InfluxClient};
use crate::plan::{resolve_range, split_chunks, RangeRequest};
use crate::scheduler::Shutdown;
use crate::transfer::{ChunkStats, TransferEngine};

/// InfluxDB's own bookkeeping database, never replicated.
const INTERNAL_DB: &str = "_internal";

/// Overall result of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Partial,
}

/// One failed measurement, kept for the job summary.
#[derive(Debug, Clone)]
pub struct MeasurementFailure {
    pub database: String,
    pub measurement: String,
    pub cause: String,
}

/// Aggregated counters for one job run.
#[derive(Debug, Default)]
pub struct JobSummary {
    pub databases: usize,
    pub measurements_ok: usize,
    pub measurements_skipped: usize,
    pub failures: Vec<MeasurementFailure>,
    pub stats: ChunkStats,
}

impl JobSummary {
    pub fn status(&self) -> RunStatus {
        if self.failures.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Partial
        }
    }
}

enum MeasurementOutcome {
    Done(ChunkStats),
    Skipped,
}

/// Orchestrates one job: databases, measurements, plans, chunks.
pub struct BackupManager {
    job: Job,
    source: InfluxClient,
    dest: InfluxClient,
    shutdown: Arc<Shutdown>,
}

impl BackupManager {
    pub fn new(
        job: Job,
        source: InfluxClient,
        dest: InfluxClient,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            job,
            source,
            dest,
            shutdown,
        }
    }

    /// Run the job once. A fatal error (endpoint catalogue unavailable)
    /// is returned; per-measurement failures land in the summary instead.
    pub async fn run(&self) -> Result<JobSummary, ReplicatorError> {
        let now = Utc::now();
        let mappings = self.resolve_mappings().await?;
        let mut summary = JobSummary {
            databases: mappings.len(),
            ..JobSummary::default()
        };

        tracing::info!(
            mode = ?self.job.mode,
            databases = mappings.len(),
            "Starting backup run"
        );

        'databases: for mapping in &mappings {
            tracing::info!(
                source_db = %mapping.source,
                dest_db = %mapping.destination,
                "Processing database"
            );

            if let Err(e) = self.dest.ensure_database(&mapping.destination).await {
                tracing::error!(
                    dest_db = %mapping.destination,
                    error = %e,
                    "Cannot ensure destination database, skipping"
                );
                summary.failures.push(MeasurementFailure {
                    database: mapping.source.clone(),
                    measurement: "*".to_string(),
                    cause: e.to_string(),
                });
                continue;
            }

            let measurements = match self.source.measurements(&mapping.source).await {
                Ok(all) => filter_measurements(
                    all,
                    &self.job.filter.include,
                    &self.job.filter.exclude,
                ),
                Err(e) => {
                    tracing::error!(
                        source_db = %mapping.source,
                        error = %e,
                        "Cannot list measurements, skipping database"
                    );
                    summary.failures.push(MeasurementFailure {
                        database: mapping.source.clone(),
                        measurement: "*".to_string(),
                        cause: e.to_string(),
                    });
                    continue;
                }
            };

            for measurement in measurements {
                if self.shutdown.is_triggered() {
                    tracing::info!("Shutdown requested, stopping after current measurement");
                    break 'databases;
                }

                match self.run_measurement(mapping, &measurement, now).await {
                    Ok(MeasurementOutcome::Done(stats)) => {
                        summary.measurements_ok += 1;
                        summary.stats.absorb(stats);
                    }
                    Ok(MeasurementOutcome::Skipped) => {
                        summary.measurements_skipped += 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            source_db = %mapping.source,
                            measurement = %measurement,
                            error = %e,
                            "Measurement failed"
                        );
                        summary.failures.push(MeasurementFailure {
                            database: mapping.source.clone(),
                            measurement,
                            cause: e.to_string(),
                        });
                    }
                }
            }
        }

        tracing::info!(
            databases = summary.databases,
            ok = summary.measurements_ok,
            skipped = summary.measurements_skipped,
            failed = summary.failures.len(),
            rows_read = summary.stats.rows_read,
            points_written = summary.stats.points_written,
            "Backup run finished"
        );

        Ok(summary)
    }

    /// Expand the configured mappings, or the source catalogue when the
    /// list is empty. `_internal` is never replicated.
    async fn resolve_mappings(&self) -> Result<Vec<DatabaseMapping>, ReplicatorError> {
        if !self.job.databases.is_empty() {
            return Ok(self.job.databases.clone());
        }

        let all = self.source.databases().await?;
        Ok(expand_catalogue(all, &self.job.db_prefix, &self.job.db_suffix))
    }

    async fn run_measurement(
        &self,
        mapping: &DatabaseMapping,
        measurement: &str,
        now: DateTime<Utc>,
    ) -> Result<MeasurementOutcome, ReplicatorError> {
        let all_fields = self
            .source
            .field_keys(&mapping.source, measurement)
            .await?;
        let policy = self.job.filter.field_policy(measurement);
        let configured = select_fields(all_fields, policy);

        if configured.is_empty() {
            tracing::debug!(measurement, "No fields left after filtering, skipping");
            return Ok(MeasurementOutcome::Skipped);
        }

        let fields: Vec<FieldDef> = if self.job.mode == Mode::Incremental {
            let active = active_fields(
                &self.dest,
                &mapping.destination,
                measurement,
                configured,
                self.job.obsolete_days,
                now,
            )
            .await?;
            if active.is_empty() {
                tracing::info!(measurement, "All configured fields obsolete, skipping");
                return Ok(MeasurementOutcome::Skipped);
            }
            active
        } else {
            configured
        };

        let field_names: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();

        let (last_ts, first_ts) = if self.job.mode == Mode::Incremental {
            let last = self
                .dest
                .last_timestamp(&mapping.destination, measurement, &field_names)
                .await?;
            let first = match last {
                Some(_) => None,
                None => {
                    self.source
                        .first_timestamp(&mapping.source, measurement, &field_names)
                        .await?
                }
            };
            (last, first)
        } else {
            (None, None)
        };

        let request = RangeRequest {
            mode: self.job.mode,
            start_date: self.job.start_date,
            end_date: self.job.end_date,
            backup_period: self.job.backup_period,
            fallback_days: self.job.fallback_days,
        };

        let Some((start, end)) = resolve_range(&request, last_ts, first_ts, now)? else {
            tracing::info!(measurement, "Destination up to date, nothing to copy");
            return Ok(MeasurementOutcome::Done(ChunkStats::default()));
        };

        let chunks = split_chunks(start, end, self.job.chunk_days);
        if chunks.len() > 1 {
            tracing::info!(
                measurement,
                chunks = chunks.len(),
                chunk_days = self.job.chunk_days,
                "Range split into chunks"
            );
        }

        let engine = TransferEngine {
            source: &self.source,
            dest: &self.dest,
            group_by: self.job.group_by.clone(),
            retries: self.job.retries,
            retry_delay: self.job.retry_delay,
        };

        let mut totals = ChunkStats::default();
        for (t0, t1) in chunks {
            if self.shutdown.is_triggered() {
                tracing::info!(
                    measurement,
                    "Shutdown requested, measurement stopped after completed chunk"
                );
                break;
            }

            match engine
                .transfer_chunk(
                    &mapping.source,
                    &mapping.destination,
                    measurement,
                    &fields,
                    t0,
                    t1,
                )
                .await
            {
                Ok(stats) => totals.absorb(stats),
                Err(e) => {
                    let attempts = if e.is_transient() {
                        self.job.retries + 1
                    } else {
                        1
                    };
                    tracing::error!(
                        measurement,
                        from = %t0.to_rfc3339(),
                        to = %t1.to_rfc3339(),
                        attempts,
                        error = %e,
                        "Chunk failed"
                    );
                    return Err(e);
                }
            }
        }

        Ok(MeasurementOutcome::Done(totals))
    }
}

/// Turn the source catalogue into mappings, excluding `_internal`.
fn expand_catalogue(names: Vec<String>, prefix: &str, suffix: &str) -> Vec<DatabaseMapping> {
    names
        .into_iter()
        .filter(|name| name.as_str() != INTERNAL_DB)
        .map(|name| {
            let destination = derive_destination(&name, prefix, suffix);
            DatabaseMapping {
                source: name,
                destination,
            }
        })
        .collect()
}
