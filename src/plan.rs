// ABOUTME: Time range resolution and chunk planning
// ABOUTME: Turns job mode and endpoint state into half-open query intervals

use chrono::{DateTime, Duration, Utc};

use crate::config::Mode;
use crate::error::ReplicatorError;

/// An ordered list of contiguous half-open intervals covering the planned
/// range. Empty means nothing to do.
pub type RangePlan = Vec<(DateTime<Utc>, DateTime<Utc>)>;

/// Inputs the planner takes from the job configuration.
#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub mode: Mode,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub backup_period: Option<Duration>,
    pub fallback_days: i64,
}

/// Parse a relative duration like `30d`, `6M`, or `1y`.
///
/// Months and years are the usual 30- and 365-day approximations.
pub fn parse_duration(s: &str) -> Result<Duration, ReplicatorError> {
    let s = s.trim();
    if s.len() < 2 || !s.is_ascii() {
        return Err(ReplicatorError::Config(format!(
            "invalid duration '{}'",
            s
        )));
    }

    let (number, unit) = s.split_at(s.len() - 1);
    let value: i64 = number.parse().map_err(|_| {
        ReplicatorError::Config(format!("invalid duration '{}'", s))
    })?;

    match unit {
        "s" => Ok(Duration::seconds(value)),
        "m" => Ok(Duration::minutes(value)),
        "h" => Ok(Duration::hours(value)),
        "d" => Ok(Duration::days(value)),
        "w" => Ok(Duration::weeks(value)),
        "M" => Ok(Duration::days(value * 30)),
        "y" => Ok(Duration::days(value * 365)),
        _ => Err(ReplicatorError::Config(format!(
            "unknown duration unit '{}' in '{}'",
            unit, s
        ))),
    }
}

/// Resolve the closed-open interval `[start, end)` to copy.
///
/// Incremental runs continue after the destination's newest point: the
/// start is advanced one nanosecond past `last_ts` so the uniform
/// `time >= start` chunk predicate stays strictly after it. With no
/// destination state the source's oldest point is used, and with no
/// source data the fallback window ending at `now`.
///
/// Returns `None` when there is nothing to copy.
pub fn resolve_range(
    req: &RangeRequest,
    last_ts: Option<DateTime<Utc>>,
    first_ts: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, ReplicatorError> {
    let (start, end) = match req.mode {
        Mode::Range => {
            let start = req.start_date.ok_or_else(|| {
                ReplicatorError::Config("range mode requires options.start_date".into())
            })?;
            let end = match (req.end_date, req.backup_period) {
                (Some(end), _) => end,
                (None, Some(period)) => start + period,
                (None, None) => {
                    return Err(ReplicatorError::Config(
                        "range mode requires options.end_date or options.backup_period".into(),
                    ))
                }
            };
            (start, end)
        }
        Mode::Incremental => {
            let end = now;
            let mut start = match (last_ts, first_ts) {
                (Some(last), _) => last + Duration::nanoseconds(1),
                (None, Some(first)) => first,
                (None, None) => now - Duration::days(req.fallback_days),
            };
            if let Some(period) = req.backup_period {
                start = start.max(end - period);
            }
            (start, end)
        }
    };

    if start >= end {
        return Ok(None);
    }
    Ok(Some((start, end)))
}

/// Split `[start, end)` into contiguous intervals no wider than
/// `chunk_days` days. Boundaries align to `start`, not to calendar days.
pub fn split_chunks(start: DateTime<Utc>, end: DateTime<Utc>, chunk_days: i64) -> RangePlan {
    let width = Duration::days(chunk_days);
    let mut chunks = Vec::new();
    let mut cursor = start;

    while cursor < end {
        let next = (cursor + width).min(end);
        chunks.push((cursor, next));
        cursor = next;
    }

    chunks
}
