//! Chunk scheduling and page result recording.
//!
//! The scheduler owns a job's page slots (`page_NNN.md` files) and a cached
//! [`TranscriptionState`]. Every event it appends is folded into the cache
//! with the same `apply` used by replay, so the cache always equals what a
//! fresh replay of the log would produce.
//!
//! # Crash safety
//!
//! ```text
//! mark_page_complete(page, content)
//!     ├─► write page_NNN.md.tmp, rename to page_NNN.md
//!     └─► append page_completed         ◄── page is "done" only from here
//!
//! update_chunk_progress(last_page)
//!     └─► fsync log                     ◄── chunk checkpoint
//! ```
//!
//! A crash between the two steps of `mark_page_complete` leaves a slot file
//! with no event. The page is still pending and its slot is overwritten on
//! retry.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::replay::{replay, TranscriptionState};
use crate::emitter::{EventEmitter, JobProgress};
use crate::error::{IoContext, LedgerError, Result};
use crate::events::{ErrorEvent, PageCompleted};

/// `error_type` for a single page that could not be transcribed.
pub const PAGE_FAILURE: &str = "page_failure";

const PAGE_SEPARATOR: &str = "\n\n---\n\n";

/// Per-page details reported alongside a completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageReport {
    pub duration_ms: u64,
    pub hallucination_detected: bool,
    pub fallback_used: Option<String>,
    pub verification_error: Option<String>,
}

impl PageReport {
    pub fn timed(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            ..Default::default()
        }
    }

    fn into_event(self, page_number: u32) -> PageCompleted {
        PageCompleted {
            page_number,
            duration_ms: self.duration_ms,
            hallucination_detected: self.hallucination_detected,
            fallback_used: self.fallback_used,
            verification_error: self.verification_error,
        }
    }
}

/// Point-in-time progress counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub total: u32,
    pub completion_percentage: f64,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Decides what to work on next and records page results for one job.
pub struct ChunkScheduler {
    pub(super) emitter: EventEmitter,
    pages_dir: PathBuf,
    state: TranscriptionState,
}

impl ChunkScheduler {
    /// Resume from the emitter's log.
    ///
    /// Fails with [`LedgerError::NotResumable`] if the log has no
    /// `job_started`; the caller must start the job fresh.
    pub fn open(emitter: EventEmitter, pages_dir: impl Into<PathBuf>) -> Result<Self> {
        let pages_dir = pages_dir.into();
        let events = emitter.log().read()?;
        let state = replay(&events).ok_or_else(|| LedgerError::NotResumable {
            path: emitter.log_path().to_path_buf(),
        })?;
        fs::create_dir_all(&pages_dir).at_path(&pages_dir)?;

        info!(
            job_id = %state.job_id,
            completed = state.completed_pages.len(),
            total_pages = state.total_pages,
            "scheduler opened"
        );
        Ok(Self {
            emitter,
            pages_dir,
            state,
        })
    }

    pub fn state(&self) -> &TranscriptionState {
        &self.state
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn pages_dir(&self) -> &Path {
        &self.pages_dir
    }

    /// Slot file for a page.
    pub fn page_path(&self, page: u32) -> PathBuf {
        self.pages_dir.join(format!("page_{page:03}.md"))
    }

    /// Pages not yet completed, ascending. Failed pages stay in this list.
    pub fn pending_pages(&self) -> Vec<u32> {
        self.state.pending_pages()
    }

    /// Pages that have failed at least once and are still pending.
    pub fn failed_pages(&self) -> Vec<u32> {
        self.state.outstanding_failures()
    }

    /// The next `chunk_size` pending pages, ascending.
    ///
    /// `chunk_size <= 0` returns every pending page.
    pub fn next_chunk(&self, chunk_size: i64) -> Vec<u32> {
        self.next_chunk_excluding(chunk_size, &BTreeSet::new())
    }

    pub(super) fn next_chunk_excluding(&self, chunk_size: i64, skip: &BTreeSet<u32>) -> Vec<u32> {
        let pending = self
            .state
            .pending_pages()
            .into_iter()
            .filter(|p| !skip.contains(p));
        match usize::try_from(chunk_size) {
            Ok(n) if n > 0 => pending.take(n).collect(),
            _ => pending.collect(),
        }
    }

    /// Store a page's content and record it complete.
    pub fn mark_page_complete(&mut self, page: u32, content: &str) -> Result<()> {
        self.mark_page_complete_with(page, content, PageReport::default())
    }

    /// Like [`mark_page_complete`](Self::mark_page_complete), with timing
    /// and quality details for the event.
    pub fn mark_page_complete_with(
        &mut self,
        page: u32,
        content: &str,
        report: PageReport,
    ) -> Result<()> {
        self.check_range(page)?;
        self.write_slot(page, content)?;
        let event = self.emitter.emit_page_completed(report.into_event(page))?;
        self.state.apply(&event);
        Ok(())
    }

    /// Record a page failure. The page remains pending.
    pub fn mark_page_failed(&mut self, page: u32, error: &str) -> Result<()> {
        self.record_failure(page, PAGE_FAILURE, error)
    }

    pub(super) fn record_failure(
        &mut self,
        page: u32,
        error_type: &str,
        error: &str,
    ) -> Result<()> {
        self.check_range(page)?;
        let event = self
            .emitter
            .emit_error(ErrorEvent::error(error_type, error).on_page(page))?;
        self.state.apply(&event);
        warn!(job_id = %self.state.job_id, page, error_type, error, "page failed");
        Ok(())
    }

    /// Checkpoint after a chunk's pages are all recorded.
    pub fn update_chunk_progress(&self, last_page: u32) -> Result<()> {
        self.emitter.log().sync()?;
        self.emitter.update_current_page(last_page);
        info!(
            job_id = %self.state.job_id,
            last_page,
            completed = self.state.completed_pages.len(),
            total_pages = self.state.total_pages,
            "chunk complete"
        );
        Ok(())
    }

    /// Completed pages joined in ascending page order, with page markers.
    pub fn assemble_output(&self) -> Result<String> {
        self.assemble_output_with(true)
    }

    /// Completed pages joined in ascending page order.
    ///
    /// With `markers`, each page is prefixed by `<!-- Page N -->`. Pages
    /// whose slot file is missing are skipped with a warning.
    pub fn assemble_output_with(&self, markers: bool) -> Result<String> {
        let mut pages = Vec::with_capacity(self.state.completed_pages.len());
        for &page in &self.state.completed_pages {
            let path = self.page_path(page);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(
                        job_id = %self.state.job_id,
                        page,
                        path = %path.display(),
                        "page slot missing, skipping"
                    );
                    continue;
                }
                Err(e) => return Err(LedgerError::io(path, e)),
            };
            pages.push(if markers {
                format!("<!-- Page {page} -->\n\n{content}")
            } else {
                content
            });
        }
        Ok(pages.join(PAGE_SEPARATOR))
    }

    pub fn progress_summary(&self) -> ProgressSummary {
        ProgressSummary {
            completed: self.state.completed_pages.len(),
            failed: self.state.outstanding_failures().len(),
            pending: self.state.pending_pages().len(),
            total: self.state.total_pages,
            completion_percentage: crate::emitter::round_to(self.state.completion_percentage(), 1),
            started_at: self.state.started_at,
            last_updated: self.state.last_updated,
        }
    }

    /// Copy current counts into the lifecycle wrapper's progress.
    pub fn sync_progress(&self, progress: &JobProgress) {
        progress.set_pages_completed(self.state.completed_pages.len() as u32);
        progress.set_pages_failed(self.state.outstanding_failures().len() as u32);
    }

    /// Re-derive the cached state from the log on disk.
    pub fn reload(&mut self) -> Result<()> {
        let events = self.emitter.log().read()?;
        self.state = replay(&events).ok_or_else(|| LedgerError::NotResumable {
            path: self.emitter.log_path().to_path_buf(),
        })?;
        Ok(())
    }

    /// Remove the page slots after the final output has been written.
    pub fn cleanup(&self) -> Result<()> {
        match fs::remove_dir_all(&self.pages_dir) {
            Ok(()) => {
                info!(path = %self.pages_dir.display(), "removed page slots");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LedgerError::io(&self.pages_dir, e)),
        }
    }

    fn check_range(&self, page: u32) -> Result<()> {
        if (1..=self.state.total_pages).contains(&page) {
            Ok(())
        } else {
            Err(LedgerError::PageOutOfRange {
                page,
                total_pages: self.state.total_pages,
            })
        }
    }

    fn write_slot(&self, page: u32, content: &str) -> Result<()> {
        let path = self.page_path(page);
        let tmp = path.with_extension("md.tmp");
        fs::write(&tmp, content).at_path(&tmp)?;
        fs::rename(&tmp, &path).at_path(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{read_events, EventKind, JobStarted};
    use crate::testing::FixedSampler;
    use tempfile::TempDir;

    fn scheduler(dir: &TempDir, total_pages: u32) -> ChunkScheduler {
        let emitter = EventEmitter::builder("a", dir.path().join("a.jsonl"))
            .sampler(FixedSampler::new(0.0, 0.0))
            .build()
            .unwrap();
        emitter
            .emit_job_started(JobStarted {
                pdf_path: "/books/a.pdf".into(),
                output_dir: dir.path().display().to_string(),
                total_pages,
                quality: "balanced".into(),
                mode: "streaming".into(),
                metadata: Default::default(),
            })
            .unwrap();
        ChunkScheduler::open(emitter, dir.path().join(".pdf-progress")).unwrap()
    }

    #[test]
    fn test_open_without_job_started_is_not_resumable() {
        let dir = TempDir::new().unwrap();
        let emitter = EventEmitter::builder("a", dir.path().join("a.jsonl"))
            .sampler(FixedSampler::new(0.0, 0.0))
            .build()
            .unwrap();
        let err = ChunkScheduler::open(emitter, dir.path().join("p")).err().unwrap();
        assert!(matches!(err, LedgerError::NotResumable { .. }));
    }

    #[test]
    fn test_next_chunk_after_partial_completion() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir, 5);
        for page in [1, 2, 3] {
            sched.mark_page_complete(page, "text").unwrap();
        }
        assert_eq!(sched.next_chunk(2), vec![4, 5]);
        assert_eq!(sched.next_chunk(1), vec![4]);
        assert_eq!(sched.next_chunk(0), vec![4, 5]);
        assert_eq!(sched.next_chunk(-3), vec![4, 5]);
    }

    #[test]
    fn test_failed_page_stays_pending() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir, 3);
        sched.mark_page_failed(2, "timeout").unwrap();
        assert_eq!(sched.pending_pages(), vec![1, 2, 3]);
        assert_eq!(sched.failed_pages(), vec![2]);

        sched.mark_page_complete(2, "retry ok").unwrap();
        assert!(sched.failed_pages().is_empty());
        assert_eq!(sched.next_chunk(5), vec![1, 3]);

        let events = read_events(sched.emitter().log_path()).unwrap();
        let EventKind::Error(err) = &events[1].kind else {
            panic!("expected error event");
        };
        assert_eq!(err.error_type, PAGE_FAILURE);
        assert_eq!(err.page_number, Some(2));
    }

    #[test]
    fn test_remarking_is_idempotent_for_derived_state() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir, 3);
        sched.mark_page_complete(1, "first").unwrap();
        let before = sched.state().completed_pages.clone();
        sched.mark_page_complete(1, "first").unwrap();

        assert_eq!(sched.state().completed_pages, before);
        let completions = read_events(sched.emitter().log_path())
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type() == "page_completed")
            .count();
        assert_eq!(completions, 2);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir, 3);
        assert!(matches!(
            sched.mark_page_complete(4, "x"),
            Err(LedgerError::PageOutOfRange { page: 4, total_pages: 3 })
        ));
        assert!(sched.mark_page_failed(0, "x").is_err());
        assert!(!sched.page_path(4).exists());
    }

    #[test]
    fn test_assemble_in_page_order() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir, 3);
        sched.mark_page_complete(3, "three").unwrap();
        sched.mark_page_complete(1, "one").unwrap();
        sched.mark_page_complete(2, "two").unwrap();

        assert_eq!(
            sched.assemble_output_with(false).unwrap(),
            "one\n\n---\n\ntwo\n\n---\n\nthree"
        );
        assert_eq!(
            sched.assemble_output().unwrap(),
            "<!-- Page 1 -->\n\none\n\n---\n\n<!-- Page 2 -->\n\ntwo\n\n---\n\n<!-- Page 3 -->\n\nthree"
        );
    }

    #[test]
    fn test_assemble_skips_missing_slot() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir, 2);
        sched.mark_page_complete(1, "one").unwrap();
        sched.mark_page_complete(2, "two").unwrap();
        fs::remove_file(sched.page_path(1)).unwrap();
        assert_eq!(sched.assemble_output_with(false).unwrap(), "two");
    }

    #[test]
    fn test_cache_matches_replay() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir, 4);
        sched.mark_page_complete(2, "b").unwrap();
        sched.mark_page_failed(3, "x").unwrap();
        sched.update_chunk_progress(3).unwrap();

        let cached = sched.state().clone();
        sched.reload().unwrap();
        assert_eq!(sched.state(), &cached);
    }

    #[test]
    fn test_progress_summary_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir, 4);
        sched.mark_page_complete(1, "a").unwrap();
        sched.mark_page_failed(2, "x").unwrap();

        let summary = sched.progress_summary();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 3);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completion_percentage, 25.0);

        let progress = JobProgress::new(4);
        sched.sync_progress(&progress);
        assert_eq!((progress.pages_completed(), progress.pages_failed()), (1, 1));

        sched.cleanup().unwrap();
        assert!(!sched.pages_dir().exists());
        sched.cleanup().unwrap();
    }
}
