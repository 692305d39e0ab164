// ABOUTME: Orchestrator entry point: one isolated worker per configuration
// ABOUTME: Discovers YAML configs, wires logging and shutdown, aggregates exit codes

mod backup;
mod config;
mod error;
mod filter;
mod influx;
mod plan;
mod scheduler;
mod transfer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::backup::{BackupManager, RunStatus};
use crate::config::{is_template_file, Config, Job, Mode};
use crate::error::ReplicatorError;
use crate::influx::InfluxClient;
use crate::scheduler::Shutdown;

const DEFAULT_CONFIG_DIR: &str = "/config";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerOutcome {
    Success,
    Partial,
    Fatal,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let config_dir =
        std::env::var("CONFIG_DIR").unwrap_or_else(|_| DEFAULT_CONFIG_DIR.to_string());
    let dir = PathBuf::from(&config_dir);

    let files = match discover_configs(&dir) {
        Ok(files) => files,
        Err(e) => {
            init_tracing("INFO");
            tracing::error!(directory = %dir.display(), error = %e, "Cannot scan configuration directory");
            return 1;
        }
    };

    // Parse everything up front so the subscriber honors the most verbose
    // configured level; load failures are reported after logging is up.
    let loaded: Vec<(PathBuf, Result<Job, ReplicatorError>)> = files
        .into_iter()
        .map(|path| {
            let job = Config::from_file(&path).and_then(|c| c.job());
            (path, job)
        })
        .collect();

    let level = most_verbose_level(
        loaded
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok().map(|j| j.log_level.as_str())),
    );
    init_tracing(level);

    tracing::info!(
        directory = %dir.display(),
        configs = loaded.len(),
        "Starting InfluxDB replication orchestrator"
    );

    if loaded.is_empty() {
        tracing::warn!("No configuration files found, nothing to do");
        return 0;
    }

    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                shutdown.trigger();
            }
        });
    }

    let mut outcomes = Vec::new();
    let mut handles = Vec::new();
    for (path, result) in loaded {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("job")
            .to_string();
        match result {
            Ok(job) => {
                tracing::info!(job = %name, "Launching worker");
                handles.push((name.clone(), tokio::spawn(run_worker(name, job, shutdown.clone()))));
            }
            Err(e) => {
                tracing::error!(config = %path.display(), error = %e, "Configuration rejected");
                outcomes.push(WorkerOutcome::Fatal);
            }
        }
    }

    let mut crashed = false;
    for (name, handle) in handles {
        match handle.await {
            Ok(outcome) => {
                tracing::info!(job = %name, outcome = ?outcome, "Worker finished");
                outcomes.push(outcome);
            }
            Err(e) => {
                tracing::error!(job = %name, panicked = e.is_panic(), "Worker crashed");
                crashed = true;
            }
        }
    }

    let code = exit_code(&outcomes, crashed);
    tracing::info!(exit_code = code, "All workers finished");
    code
}

/// One isolated worker: builds the clients, verifies both endpoints, and
/// drives the job once or on its cron schedule.
async fn run_worker(name: String, job: Job, shutdown: Arc<Shutdown>) -> WorkerOutcome {
    let source = match InfluxClient::new(
        &job.source.url,
        &job.source.user,
        &job.source.password,
        job.timeout,
    ) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(job = %name, error = %e, "Cannot build source client");
            return WorkerOutcome::Fatal;
        }
    };
    let dest = match InfluxClient::new(
        &job.destination.url,
        &job.destination.user,
        &job.destination.password,
        job.timeout,
    ) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(job = %name, error = %e, "Cannot build destination client");
            return WorkerOutcome::Fatal;
        }
    };

    for (role, client) in [("source", &source), ("destination", &dest)] {
        match client.ping().await {
            Ok(version) => {
                tracing::info!(job = %name, role, url = %client.url(), version = ?version, "Endpoint reachable");
            }
            Err(e) => {
                tracing::error!(job = %name, role, error = %e, "Endpoint unreachable");
                return WorkerOutcome::Fatal;
            }
        }
    }

    let schedule = job.schedule.clone();
    let mode = job.mode;
    let manager = BackupManager::new(job, source, dest, shutdown.clone());

    let result = match (mode, schedule) {
        (Mode::Incremental, Some(expr)) => {
            scheduler::run_with_cron(&expr, &manager, &shutdown).await
        }
        _ => scheduler::run_once(&manager).await,
    };

    match result {
        Ok(RunStatus::Success) => WorkerOutcome::Success,
        Ok(RunStatus::Partial) => WorkerOutcome::Partial,
        Err(e) => {
            tracing::error!(job = %name, error = %e, "Job failed");
            WorkerOutcome::Fatal
        }
    }
}

/// YAML configuration files in `dir`, templates excluded, sorted by name.
fn discover_configs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
                && !is_template_file(path)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn init_tracing(level: &str) {
    let directive = format!("influx_replicator={}", level_directive(level));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Map a configured log level name onto a tracing directive.
fn level_directive(level: &str) -> &'static str {
    match level {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}

/// The most verbose of the configured job levels; the subscriber is
/// process-wide, so the noisiest job wins.
fn most_verbose_level<'a>(levels: impl Iterator<Item = &'a str>) -> &'a str {
    let rank = |level: &str| match level {
        "DEBUG" => 0,
        "INFO" => 1,
        "WARNING" => 2,
        "ERROR" => 3,
        "CRITICAL" => 4,
        _ => 1,
    };
    levels.min_by_key(|l| rank(l)).unwrap_or("INFO")
}

/// 1 if anything crashed or failed to initialize, 2 if any job was
/// partial, 0 otherwise.
fn exit_code(outcomes: &[WorkerOutcome], crashed: bool) -> i32 {
    if crashed || outcomes.contains(&WorkerOutcome::Fatal) {
        1
    } else if outcomes.contains(&WorkerOutcome::Partial) {
        2
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_aggregation() {
        assert_eq!(exit_code(&[], false), 0);
        assert_eq!(
            exit_code(&[WorkerOutcome::Success, WorkerOutcome::Success], false),
            0
        );
        assert_eq!(
            exit_code(&[WorkerOutcome::Success, WorkerOutcome::Partial], false),
            2
        );
        assert_eq!(
            exit_code(&[WorkerOutcome::Partial, WorkerOutcome::Fatal], false),
            1
        );
        assert_eq!(exit_code(&[WorkerOutcome::Success], true), 1);
    }

    #[test]
    fn test_level_directive_mapping() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive("INFO"), "info");
        assert_eq!(level_directive("WARNING"), "warn");
        assert_eq!(level_directive("CRITICAL"), "error");
    }

    #[test]
    fn test_most_verbose_level_wins() {
        assert_eq!(
            most_verbose_level(["INFO", "DEBUG", "ERROR"].into_iter()),
            "DEBUG"
        );
        assert_eq!(most_verbose_level(["WARNING"].into_iter()), "WARNING");
        assert_eq!(most_verbose_level(std::iter::empty()), "INFO");
    }
}
