//! Job-lifecycle wrapper.
//!
//! [`EventEmitter::job`] brackets a unit of work with `job_started` and
//! exactly one `job_completed`, whatever way the work ends:
//!
//! | Exit | Events after `job_started` | Returns |
//! |---|---|---|
//! | body `Ok` | `job_completed` | `Ok(value)` |
//! | body `Err` | `error(transcription_failure)`, `job_completed` | `Err(JobError::Body)` |
//! | shutdown token fires | `job_completed` | `Err(JobError::Cancelled)` |
//! | body panics | `error(transcription_failure)`, `job_completed` | panic resumes |
//! | wrapper future dropped | `job_completed` | n/a |
//!
//! The last two rows run from a drop guard. Only killing the process can
//! skip the terminal event.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::EventEmitter;
use crate::error::LedgerError;
use crate::events::{ErrorEvent, JobStarted};

/// `error_type` recorded when the job body fails unexpectedly.
pub const TRANSCRIPTION_FAILURE: &str = "transcription_failure";

/// Progress counters shared between the wrapper and the job body.
///
/// The body updates these as it goes; the terminal event reports whatever
/// they hold when the job ends.
#[derive(Debug, Default)]
pub struct JobProgress {
    total_pages: AtomicU32,
    pages_completed: AtomicU32,
    pages_failed: AtomicU32,
}

impl JobProgress {
    pub fn new(total_pages: u32) -> Self {
        Self {
            total_pages: AtomicU32::new(total_pages),
            ..Default::default()
        }
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages.load(Ordering::SeqCst)
    }

    pub fn pages_completed(&self) -> u32 {
        self.pages_completed.load(Ordering::SeqCst)
    }

    pub fn pages_failed(&self) -> u32 {
        self.pages_failed.load(Ordering::SeqCst)
    }

    pub fn set_pages_completed(&self, n: u32) {
        self.pages_completed.store(n, Ordering::SeqCst);
    }

    pub fn set_pages_failed(&self, n: u32) {
        self.pages_failed.store(n, Ordering::SeqCst);
    }

    pub fn record_completed(&self) {
        self.pages_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.pages_failed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Ways a wrapped job can end other than success.
#[derive(Debug, Error)]
pub enum JobError<E> {
    /// The body returned an error (already recorded in the log)
    #[error("job failed: {0}")]
    Body(E),

    /// The shutdown token fired before the body finished
    #[error("job cancelled")]
    Cancelled,

    /// The log itself could not be written
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl<E> JobError<E> {
    /// The body's own error, if that is why the job ended.
    pub fn into_body(self) -> Option<E> {
        match self {
            JobError::Body(e) => Some(e),
            _ => None,
        }
    }
}

impl EventEmitter {
    /// Run `body` as a tracked job.
    ///
    /// Emits `job_started`, runs the body until it finishes or `shutdown`
    /// fires, then emits the terminal event and stops the heartbeat. A
    /// body error is recorded as `transcription_failure` before the
    /// terminal event and handed back unchanged in [`JobError::Body`].
    pub async fn job<F, Fut, T, E>(
        &self,
        started: JobStarted,
        shutdown: CancellationToken,
        body: F,
    ) -> Result<T, JobError<E>>
    where
        F: FnOnce(Arc<JobProgress>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let progress = Arc::new(JobProgress::new(started.total_pages));
        self.emit_job_started(started)?;

        let mut guard = JobGuard {
            emitter: self.clone(),
            progress: progress.clone(),
            armed: true,
        };

        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = body(progress) => Some(result),
        };

        match outcome {
            Some(Ok(value)) => {
                guard.finish(None).await?;
                Ok(value)
            }
            Some(Err(e)) => {
                if let Err(log_err) = guard.finish(Some(e.to_string())).await {
                    error!(
                        job_id = %self.job_id(),
                        error = %log_err,
                        "could not record job failure"
                    );
                }
                Err(JobError::Body(e))
            }
            None => {
                warn!(job_id = %self.job_id(), "job cancelled");
                guard.finish(None).await?;
                Err(JobError::Cancelled)
            }
        }
    }
}

/// Emits the terminal event if the wrapper exits without reaching `finish`.
struct JobGuard {
    emitter: EventEmitter,
    progress: Arc<JobProgress>,
    armed: bool,
}

impl JobGuard {
    async fn finish(&mut self, failure: Option<String>) -> crate::Result<()> {
        self.armed = false;
        let result = self.write_terminal(failure);
        self.emitter.stop_heartbeat().await;
        result
    }

    fn write_terminal(&self, failure: Option<String>) -> crate::Result<()> {
        let failure_result = match failure {
            Some(message) => self
                .emitter
                .emit_error(ErrorEvent::error(TRANSCRIPTION_FAILURE, message))
                .map(drop),
            None => Ok(()),
        };
        self.emitter.emit_job_completed(
            self.progress.total_pages(),
            self.progress.pages_completed(),
            self.progress.pages_failed(),
        )?;
        failure_result
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let failure = std::thread::panicking().then(|| "job body panicked".to_string());
        if let Err(e) = self.write_terminal(failure) {
            error!(job_id = %self.emitter.job_id(), error = %e, "could not record job end");
        }
        self.emitter.cancel_heartbeat();
    }
}
