//! Chunk-at-a-time pass over a job's pending pages.
//!
//! A pass walks the pending pages in chunks. Each page is attempted at most
//! once per pass, so a chunk that keeps failing cannot spin forever. Pages
//! that fail are picked up again by the next pass, or by the next process
//! that resumes the job.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::scheduler::{ChunkScheduler, PageReport};
use crate::error::Result;

/// `error_type` for every page of a chunk whose worker call failed.
pub const CHUNK_FAILURE: &str = "chunk_failure";

/// `error_type` for a page the worker silently dropped from its result.
pub const MISSING_OUTPUT: &str = "missing_output";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result for one page from a [`PageWorker`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageOutput {
    pub content: String,
    pub report: PageReport,
}

impl PageOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            report: PageReport::default(),
        }
    }
}

/// The work producer: turns a chunk of page numbers into page content.
#[async_trait]
pub trait PageWorker: Send + Sync {
    /// Process `pages`, returning output keyed by page number.
    ///
    /// An `Err` fails the whole chunk. Pages absent from an `Ok` map are
    /// failed individually.
    async fn process_chunk(
        &self,
        pages: &[u32],
    ) -> std::result::Result<BTreeMap<u32, PageOutput>, BoxError>;
}

/// Counts from one [`ChunkScheduler::run_pass`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub chunks: usize,
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ChunkScheduler {
    /// Run one pass over the pending pages, `chunk_size` pages at a time.
    ///
    /// Only log write failures abort the pass. Worker failures are recorded
    /// against their pages and the pass moves on to the next chunk.
    pub async fn run_pass<W>(&mut self, worker: &W, chunk_size: i64) -> Result<PassSummary>
    where
        W: PageWorker + ?Sized,
    {
        let mut attempted = BTreeSet::new();
        let mut summary = PassSummary::default();

        loop {
            let chunk = self.next_chunk_excluding(chunk_size, &attempted);
            let (Some(&first), Some(&last)) = (chunk.first(), chunk.last()) else {
                break;
            };
            attempted.extend(chunk.iter().copied());
            summary.chunks += 1;
            summary.attempted += chunk.len();
            self.emitter.update_current_page(first);
            debug!(job_id = %self.state().job_id, first, last, "processing chunk");

            match worker.process_chunk(&chunk).await {
                Ok(mut outputs) => {
                    for &page in &chunk {
                        match outputs.remove(&page) {
                            Some(output) => {
                                self.mark_page_complete_with(page, &output.content, output.report)?;
                                summary.completed += 1;
                            }
                            None => {
                                self.record_failure(
                                    page,
                                    MISSING_OUTPUT,
                                    "worker returned no output for page",
                                )?;
                                summary.failed += 1;
                            }
                        }
                    }
                    if !outputs.is_empty() {
                        let extra: Vec<u32> = outputs.into_keys().collect();
                        warn!(
                            job_id = %self.state().job_id,
                            pages = ?extra,
                            "ignoring output for pages outside chunk"
                        );
                    }
                    self.update_chunk_progress(last)?;
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(
                        job_id = %self.state().job_id,
                        first,
                        last,
                        error = %message,
                        "chunk failed"
                    );
                    for &page in &chunk {
                        self.record_failure(page, CHUNK_FAILURE, &message)?;
                    }
                    summary.failed += chunk.len();
                }
            }
        }

        Ok(summary)
    }
}
