//! State reconstruction by replaying an event log.
//!
//! `TranscriptionState` is never stored. It is always the fold of
//! [`TranscriptionState::apply`] over the log, starting from the first
//! `job_started`. The scheduler's in-memory cache goes through the same
//! `apply`, so cached and replayed state cannot drift apart.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{read_events, Event, EventKind, JobStarted, Severity};

/// Job state derived from the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionState {
    pub job_id: String,
    pub pdf_source: String,
    pub output_dir: String,
    pub total_pages: u32,
    pub quality: String,
    pub mode: String,
    /// Pages with a `page_completed` event, all within `1..=total_pages`.
    pub completed_pages: BTreeSet<u32>,
    /// Pages with a page-level error. Advisory: a failed page stays pending.
    pub failed_pages: BTreeSet<u32>,
    pub started_at: DateTime<Utc>,
    /// Timestamp of the most recent event applied.
    pub last_updated: DateTime<Utc>,
}

impl TranscriptionState {
    /// Initial state from a job's `job_started` event.
    pub fn seed(event: &Event, started: &JobStarted) -> Self {
        Self {
            job_id: event.job_id.clone(),
            pdf_source: started.pdf_path.clone(),
            output_dir: started.output_dir.clone(),
            total_pages: started.total_pages,
            quality: started.quality.clone(),
            mode: started.mode.clone(),
            completed_pages: BTreeSet::new(),
            failed_pages: BTreeSet::new(),
            started_at: event.timestamp,
            last_updated: event.timestamp,
        }
    }

    /// Fold one event into the state.
    ///
    /// Re-applying an event already seen leaves the state unchanged.
    pub fn apply(&mut self, event: &Event) {
        self.last_updated = event.timestamp;

        match &event.kind {
            EventKind::PageCompleted(page) => {
                if self.in_range(page.page_number) {
                    self.completed_pages.insert(page.page_number);
                } else {
                    warn!(
                        job_id = %self.job_id,
                        page = page.page_number,
                        total_pages = self.total_pages,
                        "ignoring completion for page outside document"
                    );
                }
            }
            EventKind::Error(err) if err.severity == Severity::Error => {
                if let Some(page) = err.page_number.filter(|p| self.in_range(*p)) {
                    self.failed_pages.insert(page);
                }
            }
            EventKind::JobStarted(_)
            | EventKind::Heartbeat(_)
            | EventKind::Error(_)
            | EventKind::JobCompleted(_) => {}
        }
    }

    /// Pages still to do, ascending. Previously failed pages are included.
    pub fn pending_pages(&self) -> Vec<u32> {
        (1..=self.total_pages)
            .filter(|p| !self.completed_pages.contains(p))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_pages.len() as u32 >= self.total_pages
    }

    /// Failed pages not since completed.
    pub fn outstanding_failures(&self) -> Vec<u32> {
        self.failed_pages
            .difference(&self.completed_pages)
            .copied()
            .collect()
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total_pages == 0 {
            return 0.0;
        }
        self.completed_pages.len() as f64 / self.total_pages as f64 * 100.0
    }

    fn in_range(&self, page: u32) -> bool {
        (1..=self.total_pages).contains(&page)
    }
}

/// Reconstruct state from events in log order.
///
/// Returns `None` when there is no `job_started`: such a job is not
/// resumable and must be started fresh.
pub fn replay(events: &[Event]) -> Option<TranscriptionState> {
    let (seed_event, started) = events.iter().find_map(|e| match &e.kind {
        EventKind::JobStarted(started) => Some((e, started)),
        _ => None,
    })?;

    let mut state = TranscriptionState::seed(seed_event, started);
    for event in events {
        state.apply(event);
    }

    debug!(
        job_id = %state.job_id,
        completed = state.completed_pages.len(),
        failed = state.failed_pages.len(),
        total_pages = state.total_pages,
        "replayed event log"
    );
    Some(state)
}

/// Read and replay a log file.
pub fn replay_log(path: &Path) -> Result<Option<TranscriptionState>> {
    Ok(replay(&read_events(path)?))
}

/// Outcome of the advisory recent-page check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageValidation {
    /// Every completed page, ascending and deduplicated.
    pub completed: Vec<u32>,
    /// The most recent (highest) pages selected for re-checking.
    pub validated: Vec<u32>,
}

/// Select the last `count` completed pages for re-validation.
///
/// Read-only telemetry. Nothing in scheduling consults the result; it is
/// the hook where page-slot verification would plug in.
pub fn validate_recent_pages(events: &[Event], count: usize) -> PageValidation {
    let completed: Vec<u32> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::PageCompleted(p) => Some(p.page_number),
            _ => None,
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let skip = completed.len().saturating_sub(count);
    let validated = completed[skip..].to_vec();
    PageValidation {
        completed,
        validated,
    }
}
