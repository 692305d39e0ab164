// ABOUTME: Job scheduling: immediate runs and blocking cron loops
// ABOUTME: Also owns the cooperative shutdown signal workers poll between chunks

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use cron::Schedule;
use tokio::sync::watch;

use crate::backup::{BackupManager, RunStatus};
use crate::error::ReplicatorError;

/// Cooperative shutdown signal shared by the orchestrator, schedulers,
/// and backup managers. Triggering lets in-flight chunks finish; nothing
/// new is started afterwards.
pub struct Shutdown {
    triggered: AtomicBool,
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            triggered: AtomicBool::new(false),
            tx,
        }
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a standard five-field cron expression (minute resolution).
///
/// The cron crate wants a seconds field in front, so one is prepended.
pub fn parse_cron(expr: &str) -> Result<Schedule, ReplicatorError> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| {
        ReplicatorError::Scheduling(format!("invalid cron expression '{}': {}", expr, e))
    })
}

/// Run the job once and report its status. Errors are job-fatal.
pub async fn run_once(manager: &BackupManager) -> Result<RunStatus, ReplicatorError> {
    let summary = manager.run().await?;
    Ok(summary.status())
}

/// Run the job once immediately, then on every cron tick until shutdown.
///
/// Executions never overlap: runs are serial, and ticks that elapse while
/// a run is in flight are skipped and logged. Returns the worst status
/// seen across runs; only the initial run can be job-fatal.
pub async fn run_with_cron(
    expr: &str,
    manager: &BackupManager,
    shutdown: &Shutdown,
) -> Result<RunStatus, ReplicatorError> {
    let schedule = parse_cron(expr)?;
    tracing::info!(schedule = %expr, "Scheduling recurring runs");

    let mut worst = tick(manager, &schedule).await?;

    loop {
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            tracing::warn!(schedule = %expr, "Cron schedule has no future fire times");
            break;
        };

        let wait = (next - now).to_std().unwrap_or_default();
        tracing::info!(next = %next.to_rfc3339(), "Waiting for next scheduled run");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.wait() => {
                tracing::info!("Shutdown requested, leaving the schedule loop");
                break;
            }
        }
        if shutdown.is_triggered() {
            break;
        }

        match tick(manager, &schedule).await {
            Ok(status) => {
                if status == RunStatus::Partial {
                    worst = RunStatus::Partial;
                }
            }
            Err(e) => {
                // A failed scheduled run degrades the job, but the
                // schedule keeps going until shutdown.
                tracing::error!(error = %e, "Scheduled run failed");
                worst = RunStatus::Partial;
            }
        }
    }

    Ok(worst)
}

/// Execute one run and log any ticks suppressed while it was in flight.
async fn tick(
    manager: &BackupManager,
    schedule: &Schedule,
) -> Result<RunStatus, ReplicatorError> {
    let started = Utc::now();
    let summary = manager.run().await?;
    let finished = Utc::now();

    let suppressed = schedule
        .after(&started)
        .take_while(|t| *t <= finished)
        .count();
    if suppressed > 0 {
        tracing::info!(
            suppressed,
            run_seconds = (finished - started).num_seconds(),
            "Skipped scheduled ticks that fired during the run"
        );
    }

    Ok(summary.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    #[test]
    fn test_parse_cron_five_fields() {
        let schedule = parse_cron("0 3 * * *").expect("parse");
        let after = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let next = schedule.after(&after).next().expect("next");
        assert_eq!(next.to_rfc3339(), "2024-01-01T03:00:00+00:00");
    }

    #[test]
    fn test_parse_cron_rejects_garbage() {
        assert!(matches!(
            parse_cron("not a cron"),
            Err(ReplicatorError::Scheduling(_))
        ));
        assert!(parse_cron("99 99 * * *").is_err());
    }

    #[test]
    fn test_parse_cron_every_five_minutes() {
        let schedule = parse_cron("*/5 * * * *").expect("parse");
        let after = DateTime::parse_from_rfc3339("2024-01-01T00:01:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let ticks: Vec<_> = schedule.after(&after).take(2).collect();
        assert_eq!(ticks[0].to_rfc3339(), "2024-01-01T00:05:00+00:00");
        assert_eq!(ticks[1].to_rfc3339(), "2024-01-01T00:10:00+00:00");
    }

    #[test]
    fn test_shutdown_flag() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_shutdown_wait_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        // Must not hang when the signal fired before the wait.
        shutdown.wait().await;
    }
}
