use std::collections::HashMap;

use chrono::{Days, NaiveDate};
use serde::Serialize;

/// Jobs created on one calendar day (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: i64,
}

/// Raw per-worker job counts over the last 48 hours.
#[derive(Debug, Clone, Default)]
pub struct KpiCounts {
    pub total: i64,
    pub current: i64,
    pub current_success: i64,
    pub current_error: i64,
    pub previous: i64,
    pub previous_success: i64,
    pub previous_error: i64,
}

/// Shares of a worker's 48 hour job total, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KpiWindow {
    pub jobs: f64,
    pub success: f64,
    pub error: f64,
}

/// Per-worker activity: the last 24 hours against the 24 hours before.
///
/// `success` counts return code 0 and `error` any positive return code.
/// Jobs still running count toward `jobs` only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerKpi {
    pub worker_id: i64,
    pub host_name: String,
    pub total_jobs: i64,
    pub current: KpiWindow,
    pub previous: KpiWindow,
}

impl WorkerKpi {
    pub fn from_counts(worker_id: i64, host_name: String, counts: &KpiCounts) -> Self {
        let share = |part| percent(part, counts.total);
        Self {
            worker_id,
            host_name,
            total_jobs: counts.total,
            current: KpiWindow {
                jobs: share(counts.current),
                success: share(counts.current_success),
                error: share(counts.current_error),
            },
            previous: KpiWindow {
                jobs: share(counts.previous),
                success: share(counts.previous_success),
                error: share(counts.previous_error),
            },
        }
    }
}

/// `part / total` as a percentage rounded to two decimals; 0 when empty.
pub fn percent(part: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let ratio = part as f64 * 100.0 / total as f64;
    (ratio * 100.0).round() / 100.0
}

/// One entry per day from `from` through `to`, missing days counted as 0.
pub fn zero_fill(
    from: NaiveDate,
    to: NaiveDate,
    counts: &HashMap<NaiveDate, i64>,
) -> Vec<DailyCount> {
    let mut days = Vec::new();
    let mut date = from;
    while date <= to {
        days.push(DailyCount {
            date,
            count: counts.get(&date).copied().unwrap_or(0),
        });
        match date.checked_add_days(Days::new(1)) {
            Some(next) => date = next,
            None => break,
        }
    }
    days
}
