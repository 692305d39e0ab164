// ABOUTME: Measurement and field filtering
// ABOUTME: Include/exclude/type selection plus destination obsolescence pruning

use chrono::{DateTime, Duration, Utc};

use crate::config::FieldPolicy;
use crate::error::ReplicatorError;
use crate::influx::{FieldDef, InfluxClient};

/// Apply the measurement name filter. A non-empty include list keeps only
/// the listed names; otherwise the exclude list drops names. Names are
/// case-sensitive.
pub fn filter_measurements(
    all: Vec<String>,
    include: &[String],
    exclude: &[String],
) -> Vec<String> {
    if !include.is_empty() {
        all.into_iter().filter(|m| include.contains(m)).collect()
    } else {
        all.into_iter().filter(|m| !exclude.contains(m)).collect()
    }
}

/// Apply a field policy, in order: restrict to declared types, apply the
/// include list when non-empty, then remove the exclude list.
pub fn select_fields(all: Vec<FieldDef>, policy: &FieldPolicy) -> Vec<FieldDef> {
    let by_type: Vec<FieldDef> = all
        .into_iter()
        .filter(|f| policy.types.contains(&f.kind))
        .collect();

    let included: Vec<FieldDef> = if policy.include.is_empty() {
        by_type
    } else {
        by_type
            .into_iter()
            .filter(|f| policy.include.contains(&f.name))
            .collect()
    };

    included
        .into_iter()
        .filter(|f| !policy.exclude.contains(&f.name))
        .collect()
}

/// Drop fields that are obsolete in the destination: no value newer than
/// `now - obsolete_days`. A field with no destination timestamp at all is
/// new, therefore active. Returns the active subset.
pub async fn active_fields(
    dest: &InfluxClient,
    dest_db: &str,
    measurement: &str,
    fields: Vec<FieldDef>,
    obsolete_days: i64,
    now: DateTime<Utc>,
) -> Result<Vec<FieldDef>, ReplicatorError> {
    let threshold = Duration::days(obsolete_days);
    let mut active = Vec::with_capacity(fields.len());

    for field in fields {
        let probe = vec![field.name.clone()];
        match dest.last_timestamp(dest_db, measurement, &probe).await? {
            Some(last) if now - last > threshold => {
                tracing::warn!(
                    measurement,
                    field = %field.name,
                    last_seen = %last.to_rfc3339(),
                    obsolete_days,
                    "Skipping obsolete field"
                );
            }
            _ => active.push(field),
        }
    }

    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::influx::FieldKind;

    fn defs(names: &[(&str, FieldKind)]) -> Vec<FieldDef> {
        names
            .iter()
            .map(|(n, k)| FieldDef {
                name: n.to_string(),
                kind: *k,
            })
            .collect()
    }

    fn names(fields: &[FieldDef]) -> Vec<&str> {
        fields.iter().map(|f| f.name.as_str()).collect()
    }

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_measurement_include_takes_priority() {
        let all = strs(&["cpu", "mem", "disk"]);
        let kept = filter_measurements(all, &strs(&["cpu"]), &strs(&["cpu"]));
        assert_eq!(kept, vec!["cpu"]);
    }

    #[test]
    fn test_measurement_exclude_without_include() {
        let all = strs(&["cpu", "mem", "disk"]);
        let kept = filter_measurements(all, &[], &strs(&["mem"]));
        assert_eq!(kept, vec!["cpu", "disk"]);
    }

    #[test]
    fn test_measurement_names_case_sensitive() {
        let all = strs(&["CPU", "cpu"]);
        let kept = filter_measurements(all, &strs(&["cpu"]), &[]);
        assert_eq!(kept, vec!["cpu"]);
    }

    #[test]
    fn test_field_type_restriction_applies_first() {
        let all = defs(&[
            ("usage", FieldKind::Numeric),
            ("status", FieldKind::String),
            ("up", FieldKind::Boolean),
        ]);
        let policy = FieldPolicy {
            include: strs(&["usage", "status", "up"]),
            exclude: vec![],
            types: vec![FieldKind::Numeric],
        };
        assert_eq!(names(&select_fields(all, &policy)), vec!["usage"]);
    }

    #[test]
    fn test_field_include_then_exclude() {
        let all = defs(&[
            ("a", FieldKind::Numeric),
            ("b", FieldKind::Numeric),
            ("c", FieldKind::Numeric),
        ]);
        let policy = FieldPolicy {
            include: strs(&["a", "b"]),
            exclude: strs(&["b"]),
            types: vec![FieldKind::Numeric, FieldKind::String, FieldKind::Boolean],
        };
        assert_eq!(names(&select_fields(all, &policy)), vec!["a"]);
    }

    #[test]
    fn test_field_exclude_only() {
        let all = defs(&[("a", FieldKind::Numeric), ("b", FieldKind::String)]);
        let policy = FieldPolicy {
            include: vec![],
            exclude: strs(&["a"]),
            types: vec![FieldKind::Numeric, FieldKind::String, FieldKind::Boolean],
        };
        assert_eq!(names(&select_fields(all, &policy)), vec!["b"]);
    }
}
