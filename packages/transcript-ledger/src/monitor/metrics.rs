//! Throughput and ETA from a job's event log.
//!
//! Velocity uses a rolling window of the most recent page completions so
//! it tracks the job's current pace rather than its lifetime average.

use std::path::Path;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use crate::emitter::round_to;
use crate::error::Result;
use crate::events::{read_events, Event, EventKind};

/// Derived metrics for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobMetrics {
    pub current_page: u32,
    pub total_pages: u32,
    pub pages_completed: usize,
    pub progress_percent: f64,
    /// Pages per hour over the rolling window, 0 when unknown.
    pub velocity: f64,
    /// Completions actually used for `velocity`.
    pub window_size: usize,
    #[serde(skip)]
    pub elapsed: Option<chrono::Duration>,
    pub eta_hours: Option<f64>,
    pub completion_time: Option<DateTime<Utc>>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Metrics for the log at `path` as of now.
pub fn calculate_metrics(
    path: &Path,
    window: usize,
    min_pages: usize,
) -> Result<Option<JobMetrics>> {
    calculate_metrics_at(path, window, min_pages, Utc::now())
}

pub fn calculate_metrics_at(
    path: &Path,
    window: usize,
    min_pages: usize,
    now: DateTime<Utc>,
) -> Result<Option<JobMetrics>> {
    Ok(metrics_from_events(&read_events(path)?, window, min_pages, now))
}

/// Metrics from already-read events.
///
/// `None` when the log has no `job_started` or no page completions.
pub fn metrics_from_events(
    events: &[Event],
    window: usize,
    min_pages: usize,
    now: DateTime<Utc>,
) -> Option<JobMetrics> {
    let mut started: Option<(DateTime<Utc>, u32)> = None;
    let mut heartbeat_page = None;
    let mut highest_page = 0;
    let mut cpu_percent = 0.0;
    let mut memory_mb = 0.0;
    let mut page_times = Vec::new();

    for event in events {
        match &event.kind {
            EventKind::JobStarted(s) if started.is_none() => {
                started = Some((event.timestamp, s.total_pages));
            }
            EventKind::PageCompleted(page) => {
                page_times.push(event.timestamp);
                highest_page = highest_page.max(page.page_number);
            }
            EventKind::Heartbeat(beat) => {
                heartbeat_page = Some(beat.current_page);
                cpu_percent = beat.cpu_percent;
                memory_mb = beat.memory_mb;
            }
            _ => {}
        }
    }

    let (started_at, total_pages) = started?;
    if page_times.is_empty() {
        return None;
    }

    let current_page = heartbeat_page.unwrap_or(highest_page);
    let progress_percent = if total_pages > 0 {
        current_page as f64 / total_pages as f64 * 100.0
    } else {
        0.0
    };

    let (velocity, window_size) = rolling_velocity(&page_times, window, min_pages);
    let eta_hours = (velocity > 0.0 && total_pages > current_page)
        .then(|| (total_pages - current_page) as f64 / velocity)
        .filter(|eta| eta.is_finite());
    let completion_time = eta_hours.and_then(|eta| completion_after(now, eta));

    Some(JobMetrics {
        current_page,
        total_pages,
        pages_completed: page_times.len(),
        progress_percent: round_to(progress_percent, 1),
        velocity: round_to(velocity, 1),
        window_size,
        elapsed: Some(now - started_at),
        eta_hours,
        completion_time,
        cpu_percent,
        memory_mb,
    })
}

/// `now + eta_hours`, or `None` when that lies outside chrono's range.
fn completion_after(now: DateTime<Utc>, eta_hours: f64) -> Option<DateTime<Utc>> {
    let eta_ms = eta_hours * 3_600_000.0;
    if !(0.0..i64::MAX as f64).contains(&eta_ms) {
        return None;
    }
    let offset = chrono::Duration::try_milliseconds(eta_ms as i64)?;
    now.checked_add_signed(offset)
}

/// Pages per hour over the last `window` completion timestamps.
///
/// Returns `(velocity, pages_used)`. Fewer than `min_pages` completions
/// gives `(0.0, 0)`; a zero time span gives `(0.0, pages_used)`.
pub fn rolling_velocity(
    page_times: &[DateTime<Utc>],
    window: usize,
    min_pages: usize,
) -> (f64, usize) {
    if page_times.len() < min_pages {
        return (0.0, 0);
    }

    let mut sorted = page_times.to_vec();
    sorted.sort();
    let recent = &sorted[sorted.len().saturating_sub(window)..];
    if recent.len() < min_pages {
        return (0.0, 0);
    }

    let (Some(first), Some(last)) = (recent.first(), recent.last()) else {
        return (0.0, 0);
    };
    let span_secs = (*last - *first).num_milliseconds() as f64 / 1000.0;
    if span_secs <= 0.0 {
        return (0.0, recent.len());
    }

    (recent.len() as f64 / (span_secs / 3600.0), recent.len())
}

/// `"2h 5m"`, `"45m"`, or `"Unknown"`.
pub fn format_elapsed(elapsed: Option<chrono::Duration>) -> String {
    let Some(elapsed) = elapsed else {
        return "Unknown".to_string();
    };
    let total = elapsed.num_seconds().max(0);
    let (hours, minutes) = (total / 3600, (total % 3600) / 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

/// `"~40m"` under an hour, `"~2.5h"` otherwise, `"Unknown"` when absent.
pub fn format_eta(eta_hours: Option<f64>) -> String {
    match eta_hours {
        Some(eta) if eta > 0.0 && eta < 1.0 => format!("~{}m", (eta * 60.0) as u64),
        Some(eta) if eta >= 1.0 => format!("~{eta:.1}h"),
        _ => "Unknown".to_string(),
    }
}

/// Local wall-clock `HH:MM`, or `"Unknown"`.
pub fn format_completion_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.with_timezone(&Local).format("%H:%M").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}
