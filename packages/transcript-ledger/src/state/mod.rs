//! Write-path state: replay, scheduling and the chunk pass driver.

pub mod driver;
pub mod replay;
pub mod scheduler;

pub use driver::{BoxError, PageOutput, PageWorker, PassSummary, CHUNK_FAILURE, MISSING_OUTPUT};
pub use replay::{replay, replay_log, validate_recent_pages, PageValidation, TranscriptionState};
pub use scheduler::{ChunkScheduler, PageReport, ProgressSummary, PAGE_FAILURE};
