//! Job discovery and liveness classification.
//!
//! Scans an output root for job directories carrying an `events.jsonl`
//! (usually a link to the central log), replays each log into a
//! [`JobInfo`], and classifies it:
//!
//! ```text
//!            job_completed seen, or
//!            <job_dir>/<job_dir>.md exists
//! ACTIVE ──────────────────────────────────────► COMPLETED (terminal)
//!   │  ▲
//!   │  │ fresh heartbeat
//!   ▼  │
//! STALLED  (≥1 heartbeat seen and the latest is older than the threshold)
//! ```
//!
//! Discovery never writes. Logs that cannot be read are skipped with a
//! warning so one bad job cannot hide the others.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::EVENT_LOG_LINK;
use crate::error::{IoContext, Result};
use crate::events::{read_events, Event, EventKind, Severity};

/// Liveness of a discovered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Liveness {
    Active,
    Stalled,
    Completed,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Liveness::Active => "ACTIVE",
            Liveness::Stalled => "STALLED",
            Liveness::Completed => "COMPLETED",
        })
    }
}

/// Read model of one job, built from its full event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobInfo {
    pub job_id: String,
    pub output_dir: PathBuf,
    /// Log actually read (link target when `events.jsonl` is a link).
    pub event_log_path: PathBuf,

    // From job_started
    pub pdf_path: Option<String>,
    pub total_pages: Option<u32>,
    pub quality: Option<String>,
    pub mode: Option<String>,
    pub metadata: Option<Map<String, Value>>,

    pub current_page: u32,
    pub pages_completed: u32,

    pub started_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub is_active: bool,
    pub is_stalled: bool,

    pub error_count: u32,
    pub warning_count: u32,

    // From the latest heartbeat
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

impl JobInfo {
    /// Fold a job's events into a read model. `None` for an empty log.
    ///
    /// Liveness is left unclassified (`is_active == false`) until
    /// [`classify`](Self::classify) runs.
    pub fn from_events(
        job_id: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        event_log_path: impl Into<PathBuf>,
        events: &[Event],
    ) -> Option<Self> {
        let last = events.last()?;
        let mut info = Self {
            job_id: job_id.into(),
            output_dir: output_dir.into(),
            event_log_path: event_log_path.into(),
            pdf_path: None,
            total_pages: None,
            quality: None,
            mode: None,
            metadata: None,
            current_page: 0,
            pages_completed: 0,
            started_at: None,
            last_event_at: Some(last.timestamp),
            last_heartbeat: None,
            completed_at: None,
            is_active: false,
            is_stalled: false,
            error_count: 0,
            warning_count: 0,
            cpu_percent: 0.0,
            memory_mb: 0.0,
        };

        let mut completed = BTreeSet::new();
        for event in events {
            match &event.kind {
                EventKind::JobStarted(started) => {
                    if info.started_at.is_none() {
                        info.pdf_path = Some(started.pdf_path.clone());
                        info.total_pages = Some(started.total_pages);
                        info.quality = Some(started.quality.clone());
                        info.mode = Some(started.mode.clone());
                        info.metadata = Some(started.metadata.clone());
                        info.started_at = Some(event.timestamp);
                    }
                }
                EventKind::PageCompleted(page) => {
                    completed.insert(page.page_number);
                    info.current_page = info.current_page.max(page.page_number);
                }
                EventKind::Heartbeat(beat) => {
                    info.last_heartbeat = Some(event.timestamp);
                    info.current_page = beat.current_page;
                    info.cpu_percent = beat.cpu_percent;
                    info.memory_mb = beat.memory_mb;
                }
                EventKind::Error(err) => match err.severity {
                    Severity::Error => info.error_count += 1,
                    Severity::Warning => info.warning_count += 1,
                },
                EventKind::JobCompleted(done) => {
                    info.completed_at = Some(event.timestamp);
                    info.error_count = done.error_count;
                    info.warning_count = done.warning_count;
                }
            }
        }
        info.pages_completed = completed.len() as u32;
        Some(info)
    }

    /// Decide liveness as of `now`.
    ///
    /// Without a `job_completed`, a regular file `<output_dir>/<job_id>.md`
    /// marks the job complete as of that file's modification time.
    pub fn classify(&mut self, stale_threshold: Duration, now: DateTime<Utc>) {
        self.is_stalled = false;
        if self.completed_at.is_none() {
            if let Some(mtime) = final_output_mtime(&self.output_dir, &self.job_id) {
                debug!(job_id = %self.job_id, "inferred completion from final output");
                self.completed_at = Some(mtime);
            }
        }

        self.is_active = self.completed_at.is_none();
        if self.is_active {
            if let Some(beat) = self.last_heartbeat {
                let age_secs = (now - beat).num_milliseconds() as f64 / 1000.0;
                self.is_stalled = age_secs > stale_threshold.as_secs_f64();
            }
        }
    }

    pub fn liveness(&self) -> Liveness {
        match (self.is_active, self.is_stalled) {
            (false, _) => Liveness::Completed,
            (true, true) => Liveness::Stalled,
            (true, false) => Liveness::Active,
        }
    }
}

/// Modification time of the job's verified final output, if present.
fn final_output_mtime(job_dir: &Path, job_id: &str) -> Option<DateTime<Utc>> {
    let meta = fs::metadata(job_dir.join(format!("{job_id}.md"))).ok()?;
    if !meta.is_file() {
        return None;
    }
    meta.modified().ok().map(DateTime::<Utc>::from)
}

/// Discover and classify every job under `root`.
pub fn discover_jobs(root: &Path, stale_threshold: Duration) -> Result<Vec<JobInfo>> {
    discover_jobs_at(root, stale_threshold, Utc::now())
}

/// [`discover_jobs`] with an explicit clock.
///
/// Active jobs come first, most pages in first; completed jobs follow,
/// most recently completed first.
pub fn discover_jobs_at(
    root: &Path,
    stale_threshold: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<JobInfo>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(root = %root.display(), "output root not found");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e).at_path(root),
    };

    let mut jobs = Vec::new();
    for entry in entries {
        let job_dir = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                warn!(root = %root.display(), error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !job_dir.is_dir() {
            continue;
        }
        let link = job_dir.join(EVENT_LOG_LINK);
        if fs::symlink_metadata(&link).is_err() {
            continue;
        }

        match load_job(&job_dir, &link) {
            Ok(Some(mut info)) => {
                info.classify(stale_threshold, now);
                jobs.push(info);
            }
            Ok(None) => debug!(job_dir = %job_dir.display(), "empty event log"),
            Err(e) => warn!(job_dir = %job_dir.display(), error = %e, "failed to read job events"),
        }
    }

    sort_for_display(&mut jobs);
    Ok(jobs)
}

fn load_job(job_dir: &Path, link: &Path) -> Result<Option<JobInfo>> {
    let log_path = fs::canonicalize(link).unwrap_or_else(|_| link.to_path_buf());
    let events = read_events(&log_path)?;
    let job_id = job_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(JobInfo::from_events(job_id, job_dir, log_path, &events))
}

/// Active first by progress (descending), then completed by recency.
pub fn sort_for_display(jobs: &mut [JobInfo]) {
    jobs.sort_by(|a, b| {
        b.is_active
            .cmp(&a.is_active)
            .then_with(|| {
                if a.is_active {
                    b.current_page.cmp(&a.current_page)
                } else {
                    b.completed_at.cmp(&a.completed_at)
                }
            })
            .then_with(|| a.job_id.cmp(&b.job_id))
    });
}
