//! Testing utilities: fixture logs, a fixed resource sampler and a
//! scripted page worker.
//!
//! These let applications (and this crate's own tests) exercise replay,
//! discovery and metrics against logs with exact timestamps, without
//! waiting on real time or a real transcription backend.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::config::EVENT_LOG_LINK;
use crate::emitter::{ResourceSample, ResourceSampler};
use crate::events::{
    ErrorEvent, Event, EventKind, Heartbeat, JobCompleted, JobStarted, PageCompleted, Severity,
};
use crate::state::{BoxError, PageOutput, PageReport, PageWorker};

/// Builds an event log with explicit timestamps.
///
/// Offsets passed to the `*_at` methods are relative to the start time.
pub struct LogBuilder {
    job_id: String,
    start: DateTime<Utc>,
    events: Vec<Event>,
}

impl LogBuilder {
    /// CPU figure carried by every fixture heartbeat.
    pub const HEARTBEAT_CPU: f64 = 42.5;
    /// Memory figure carried by every fixture heartbeat.
    pub const HEARTBEAT_MEMORY_MB: f64 = 512.0;

    pub fn new(job_id: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            start,
            events: Vec::new(),
        }
    }

    /// `job_started` at the start time, output dir `/out/<job_id>`.
    pub fn started(self, total_pages: u32) -> Self {
        let output_dir = PathBuf::from("/out").join(&self.job_id);
        self.started_in(total_pages, &output_dir)
    }

    /// `job_started` at the start time with a real output directory.
    pub fn started_in(self, total_pages: u32, output_dir: &Path) -> Self {
        let kind = JobStarted {
            pdf_path: format!("/books/{}.pdf", self.job_id),
            output_dir: output_dir.display().to_string(),
            total_pages,
            quality: "balanced".into(),
            mode: "streaming".into(),
            metadata: Default::default(),
        }
        .into();
        self.push(Duration::zero(), kind)
    }

    pub fn page_at(self, offset: Duration, page: u32) -> Self {
        self.push(offset, PageCompleted::new(page, 1_000).into())
    }

    pub fn heartbeat_at(self, offset: Duration, current_page: u32, total_pages: u32) -> Self {
        let kind = Heartbeat {
            current_page,
            total_pages,
            pages_completed_since_last_heartbeat: 0,
            cpu_percent: Self::HEARTBEAT_CPU,
            memory_mb: Self::HEARTBEAT_MEMORY_MB,
        }
        .into();
        self.push(offset, kind)
    }

    pub fn error_at(self, offset: Duration, severity: Severity, page: Option<u32>) -> Self {
        let kind = ErrorEvent {
            severity,
            error_type: "ocr_fail".into(),
            error_message: "fixture failure".into(),
            page_number: page,
        }
        .into();
        self.push(offset, kind)
    }

    /// `job_completed` with authoritative error and warning totals.
    pub fn completed_at(
        self,
        offset: Duration,
        total_pages: u32,
        pages_completed: u32,
        error_count: u32,
        warning_count: u32,
    ) -> Self {
        let kind = JobCompleted {
            total_pages,
            pages_completed,
            pages_failed: total_pages.saturating_sub(pages_completed),
            total_duration_seconds: offset.num_milliseconds() as f64 / 1000.0,
            avg_velocity_pages_per_hour: 0.0,
            error_count,
            warning_count,
        }
        .into();
        self.push(offset, kind)
    }

    pub fn push(mut self, offset: Duration, kind: EventKind) -> Self {
        self.events
            .push(Event::at(self.start + offset, self.job_id.clone(), kind));
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.clone()
    }

    /// Write the log to `path`, returning it.
    pub fn write_to(&self, path: &Path) -> PathBuf {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create log dir");
        }
        let text: String = self
            .events
            .iter()
            .map(|e| e.to_json_line().expect("encode event"))
            .collect();
        fs::write(path, text).expect("write log");
        path.to_path_buf()
    }

    /// Write as `<root>/<job_id>/events.jsonl` (a plain file), returning
    /// the job directory.
    pub fn write_job(&self, root: &Path) -> PathBuf {
        let job_dir = root.join(&self.job_id);
        self.write_to(&job_dir.join(EVENT_LOG_LINK));
        job_dir
    }

    /// Write the central log `<telemetry_dir>/<job_id>.jsonl` and link it
    /// from `<job_dir>/events.jsonl`, returning the central path.
    #[cfg(unix)]
    pub fn write_linked(&self, telemetry_dir: &Path, job_dir: &Path) -> PathBuf {
        let log = self.write_to(&telemetry_dir.join(format!("{}.jsonl", self.job_id)));
        fs::create_dir_all(job_dir).expect("create job dir");
        std::os::unix::fs::symlink(&log, job_dir.join(EVENT_LOG_LINK)).expect("link log");
        log
    }
}

/// A sampler that always reports the same figures.
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler(ResourceSample);

impl FixedSampler {
    pub fn new(cpu_percent: f64, memory_mb: f64) -> Self {
        Self(ResourceSample {
            cpu_percent,
            memory_mb,
        })
    }
}

impl ResourceSampler for FixedSampler {
    fn sample(&self) -> io::Result<ResourceSample> {
        Ok(self.0)
    }
}

/// A page worker with scripted failures.
///
/// By default every page succeeds with content `"page N"`.
#[derive(Default, Clone)]
pub struct ScriptedWorker {
    fail_pages: BTreeSet<u32>,
    /// How many chunks may fail before failures stop; `None` = always.
    fail_budget: Option<usize>,
    omit_pages: BTreeSet<u32>,
    failures: Arc<RwLock<usize>>,
    calls: Arc<RwLock<Vec<Vec<u32>>>>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any chunk that contains `page`.
    pub fn fail_chunk_containing(mut self, page: u32) -> Self {
        self.fail_pages.insert(page);
        self
    }

    /// Stop failing after `n` failed chunks.
    pub fn fail_times(mut self, n: usize) -> Self {
        self.fail_budget = Some(n);
        self
    }

    /// Succeed, but leave `page` out of the result.
    pub fn omit_page(mut self, page: u32) -> Self {
        self.omit_pages.insert(page);
        self
    }

    /// Every chunk received, in order.
    pub fn calls(&self) -> Vec<Vec<u32>> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl PageWorker for ScriptedWorker {
    async fn process_chunk(&self, pages: &[u32]) -> Result<BTreeMap<u32, PageOutput>, BoxError> {
        self.calls.write().unwrap().push(pages.to_vec());

        if pages.iter().any(|p| self.fail_pages.contains(p)) {
            let mut failures = self.failures.write().unwrap();
            if self.fail_budget.map_or(true, |budget| *failures < budget) {
                *failures += 1;
                return Err(format!("scripted failure for pages {pages:?}").into());
            }
        }

        Ok(pages
            .iter()
            .filter(|p| !self.omit_pages.contains(p))
            .map(|&p| {
                let output = PageOutput {
                    content: format!("page {p}"),
                    report: PageReport::timed(1_000),
                };
                (p, output)
            })
            .collect())
    }
}
