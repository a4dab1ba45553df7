//! Event emission for a single job.
//!
//! The `EventEmitter` is the only writer of a job's log. It:
//! - Stamps and appends events via [`EventLog`]
//! - Keeps running counters (errors, warnings, current page) for the
//!   heartbeat and the terminal event
//! - Runs the background heartbeat task
//! - Provides the [`EventEmitter::job`] lifecycle wrapper
//!
//! # Architecture
//!
//! ```text
//! EventEmitter (Clone, shared)
//!     │
//!     ├─► EventLog ──► <telemetry_dir>/<job_id>.jsonl
//!     │                      ▲
//!     │                      └── <job_output_dir>/events.jsonl (symlink)
//!     │
//!     └─► HeartbeatHandle ──► every interval: sample CPU/RSS, emit heartbeat
//! ```
//!
//! # Example
//!
//! ```ignore
//! let emitter = EventEmitter::for_job("book", &config, &job_dir)?;
//! emitter.start_heartbeat(total_pages);
//! let pages = emitter
//!     .job(started, shutdown, |progress| async move { transcribe(progress).await })
//!     .await?;
//! ```

mod heartbeat;
mod lifecycle;
mod resources;

pub use heartbeat::HeartbeatHandle;
pub use lifecycle::{JobError, JobProgress, TRANSCRIPTION_FAILURE};
pub use resources::{sample_or_zero, ProcessSampler, ResourceSample, ResourceSampler};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{LedgerConfig, EVENT_LOG_LINK};
use crate::error::Result;
use crate::events::{
    ErrorEvent, Event, EventKind, EventLog, Heartbeat, JobCompleted, JobStarted, PageCompleted,
    Severity,
};

/// Writes events for one job. Cheap to clone.
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

struct EmitterInner {
    job_id: String,
    log: EventLog,
    sampler: Box<dyn ResourceSampler>,
    heartbeat_interval: Duration,
    heartbeat_stop_timeout: Duration,
    started: Mutex<Option<Instant>>,
    current_page: AtomicU32,
    pages_at_last_heartbeat: AtomicU32,
    error_count: AtomicU32,
    warning_count: AtomicU32,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl Drop for EmitterInner {
    fn drop(&mut self) {
        let slot = self.heartbeat.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.cancel();
        }
    }
}

/// Builder for [`EventEmitter`].
pub struct EmitterBuilder {
    job_id: String,
    log_path: PathBuf,
    link_dir: Option<PathBuf>,
    sampler: Option<Box<dyn ResourceSampler>>,
    heartbeat_interval: Duration,
    heartbeat_stop_timeout: Duration,
}

impl EmitterBuilder {
    /// Also place an `events.jsonl` link to the log in `dir`.
    pub fn link_into(mut self, dir: impl Into<PathBuf>) -> Self {
        self.link_dir = Some(dir.into());
        self
    }

    pub fn sampler(mut self, sampler: impl ResourceSampler + 'static) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_stop_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_stop_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<EventEmitter> {
        let log = EventLog::create(&self.log_path)?;
        if let Some(dir) = &self.link_dir {
            link_event_log(&self.log_path, dir);
        }

        Ok(EventEmitter {
            inner: Arc::new(EmitterInner {
                job_id: self.job_id,
                log,
                sampler: self
                    .sampler
                    .unwrap_or_else(|| Box::new(ProcessSampler::new())),
                heartbeat_interval: self.heartbeat_interval,
                heartbeat_stop_timeout: self.heartbeat_stop_timeout,
                started: Mutex::new(None),
                current_page: AtomicU32::new(0),
                pages_at_last_heartbeat: AtomicU32::new(0),
                error_count: AtomicU32::new(0),
                warning_count: AtomicU32::new(0),
                heartbeat: Mutex::new(None),
            }),
        })
    }
}

impl EventEmitter {
    /// Start building an emitter writing to `log_path`.
    pub fn builder(job_id: impl Into<String>, log_path: impl Into<PathBuf>) -> EmitterBuilder {
        let defaults = LedgerConfig::default();
        EmitterBuilder {
            job_id: job_id.into(),
            log_path: log_path.into(),
            link_dir: None,
            sampler: None,
            heartbeat_interval: defaults.heartbeat_interval,
            heartbeat_stop_timeout: defaults.heartbeat_stop_timeout,
        }
    }

    /// Emitter for a job using the central log location from `config`,
    /// linked into the job's output directory.
    pub fn for_job(
        job_id: impl Into<String>,
        config: &LedgerConfig,
        job_output_dir: &Path,
    ) -> Result<Self> {
        let job_id = job_id.into();
        Self::builder(job_id.clone(), config.event_log_path(&job_id))
            .link_into(job_output_dir)
            .heartbeat_interval(config.heartbeat_interval)
            .heartbeat_stop_timeout(config.heartbeat_stop_timeout)
            .build()
    }

    pub fn job_id(&self) -> &str {
        &self.inner.job_id
    }

    pub fn log(&self) -> &EventLog {
        &self.inner.log
    }

    pub fn log_path(&self) -> &Path {
        self.inner.log.path()
    }

    pub fn error_count(&self) -> u32 {
        self.inner.error_count.load(Ordering::SeqCst)
    }

    pub fn warning_count(&self) -> u32 {
        self.inner.warning_count.load(Ordering::SeqCst)
    }

    pub fn emit_job_started(&self, started: JobStarted) -> Result<Event> {
        *self
            .inner
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        let total_pages = started.total_pages;
        let event = self.inner.append(started.into())?;
        info!(job_id = %self.inner.job_id, total_pages, "job started");
        Ok(event)
    }

    pub fn emit_page_completed(&self, page: PageCompleted) -> Result<Event> {
        self.inner
            .current_page
            .store(page.page_number, Ordering::SeqCst);

        let (page_number, duration_ms) = (page.page_number, page.duration_ms);
        let fallback = page.fallback_used.clone();
        let verification_error = page.verification_error.clone();
        let event = self.inner.append(page.into())?;

        match fallback {
            Some(fallback) => info!(
                job_id = %self.inner.job_id,
                page = page_number,
                duration_ms,
                fallback = %fallback,
                verification_error = ?verification_error,
                "page completed via fallback"
            ),
            None => debug!(
                job_id = %self.inner.job_id,
                page = page_number,
                duration_ms,
                "page completed"
            ),
        }
        Ok(event)
    }

    /// Emit a heartbeat reporting `current_page` as in progress.
    pub fn emit_heartbeat(&self, current_page: u32, total_pages: u32) -> Result<Event> {
        self.update_current_page(current_page);
        self.inner.emit_heartbeat(total_pages)
    }

    pub fn emit_error(&self, error: ErrorEvent) -> Result<Event> {
        match error.severity {
            Severity::Error => self.inner.error_count.fetch_add(1, Ordering::SeqCst),
            Severity::Warning => self.inner.warning_count.fetch_add(1, Ordering::SeqCst),
        };

        let (severity, error_type, page) =
            (error.severity, error.error_type.clone(), error.page_number);
        let message = error.error_message.clone();
        let event = self.inner.append(error.into())?;
        match severity {
            Severity::Error => info!(
                job_id = %self.inner.job_id,
                error_type = %error_type,
                page = ?page,
                message = %message,
                "job error recorded"
            ),
            Severity::Warning => info!(
                job_id = %self.inner.job_id,
                error_type = %error_type,
                page = ?page,
                message = %message,
                "job warning recorded"
            ),
        }
        Ok(event)
    }

    /// Emit the terminal event, computing duration and average velocity.
    pub fn emit_job_completed(
        &self,
        total_pages: u32,
        pages_completed: u32,
        pages_failed: u32,
    ) -> Result<Event> {
        let duration = self
            .inner
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let velocity = if duration > 0.0 {
            pages_completed as f64 / duration * 3600.0
        } else {
            0.0
        };

        let event = self.inner.append(
            JobCompleted {
                total_pages,
                pages_completed,
                pages_failed,
                total_duration_seconds: round_to(duration, 2),
                avg_velocity_pages_per_hour: round_to(velocity, 1),
                error_count: self.error_count(),
                warning_count: self.warning_count(),
            }
            .into(),
        )?;
        info!(
            job_id = %self.inner.job_id,
            pages_completed,
            total_pages,
            duration_secs = round_to(duration, 1),
            pages_per_hour = round_to(velocity, 1),
            "job completed"
        );
        Ok(event)
    }

    /// Set the page the heartbeat reports without completing it.
    pub fn update_current_page(&self, page: u32) {
        self.inner.current_page.store(page, Ordering::SeqCst);
    }

    pub fn current_page(&self) -> u32 {
        self.inner.current_page.load(Ordering::SeqCst)
    }

    /// Start the background heartbeat. A second call while one is running
    /// is ignored with a warning.
    pub fn start_heartbeat(&self, total_pages: u32) {
        let mut slot = self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!(job_id = %self.inner.job_id, "heartbeat already running");
            return;
        }

        let weak: Weak<EmitterInner> = Arc::downgrade(&self.inner);
        *slot = HeartbeatHandle::spawn(self.inner.heartbeat_interval, move || {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            if let Err(e) = inner.emit_heartbeat(total_pages) {
                warn!(job_id = %inner.job_id, error = %e, "heartbeat failed");
            }
            true
        });

        if slot.is_some() {
            info!(
                job_id = %self.inner.job_id,
                interval_secs = self.inner.heartbeat_interval.as_secs(),
                "heartbeat started"
            );
        }
    }

    /// Stop the heartbeat, waiting at most the configured stop timeout.
    pub async fn stop_heartbeat(&self) {
        let handle = self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop(self.inner.heartbeat_stop_timeout).await;
            info!(job_id = %self.inner.job_id, "heartbeat stopped");
        }
    }

    /// Signal the heartbeat to stop without waiting.
    pub(crate) fn cancel_heartbeat(&self) {
        let handle = self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl EmitterInner {
    fn append(&self, kind: EventKind) -> Result<Event> {
        self.log.append(&self.job_id, kind)
    }

    fn emit_heartbeat(&self, total_pages: u32) -> Result<Event> {
        let current_page = self.current_page.load(Ordering::SeqCst);
        let previous = self.pages_at_last_heartbeat.swap(current_page, Ordering::SeqCst);
        let sample = sample_or_zero(self.sampler.as_ref());

        let event = self.append(
            Heartbeat {
                current_page,
                total_pages,
                pages_completed_since_last_heartbeat: current_page.saturating_sub(previous),
                cpu_percent: round_to(sample.cpu_percent, 1),
                memory_mb: round_to(sample.memory_mb, 1),
            }
            .into(),
        )?;
        debug!(
            job_id = %self.job_id,
            current_page,
            total_pages,
            cpu_percent = sample.cpu_percent,
            memory_mb = sample.memory_mb,
            "heartbeat"
        );
        Ok(event)
    }
}

/// Point `<dir>/events.jsonl` at the central log. Failure only warns.
fn link_event_log(log_path: &Path, dir: &Path) {
    let link = dir.join(EVENT_LOG_LINK);
    if link == log_path {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(
            path = %dir.display(),
            error = %e,
            "could not create job output dir for event log link"
        );
        return;
    }
    if std::fs::symlink_metadata(&link).is_ok() {
        if let Err(e) = std::fs::remove_file(&link) {
            warn!(path = %link.display(), error = %e, "could not replace stale event log link");
            return;
        }
    }

    #[cfg(unix)]
    let linked = std::os::unix::fs::symlink(log_path, &link);
    #[cfg(not(unix))]
    let linked: std::io::Result<()> = Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are unix-only",
    ));

    match linked {
        Ok(()) => debug!(link = %link.display(), target = %log_path.display(), "linked event log"),
        Err(e) => warn!(
            link = %link.display(),
            error = %e,
            "could not link event log, central log still written"
        ),
    }
}

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}
