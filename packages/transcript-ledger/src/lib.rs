//! Event-Sourced Progress Ledger for Transcription Jobs
//!
//! Tracks long-running, page-at-a-time jobs so that progress survives
//! crashes, resumes without redoing finished pages, and can be watched
//! live from another process.
//!
//! # Design
//!
//! **The log is the only truth.**
//!
//! - One append-only JSONL file per job; lines are never rewritten
//! - All state is a replay of that file; caches are rebuilt the same way
//! - Readers tolerate a half-written last line
//! - Resuming is safe because scheduling is a pure function of the log
//!
//! # Architecture
//!
//! ```text
//!            write path                               read path
//!  ┌──────────────────────────┐            ┌──────────────────────────┐
//!  │ EventEmitter             │            │ discover_jobs            │
//!  │   ├─ job() wrapper       │            │   └─ JobInfo + Liveness  │
//!  │   └─ heartbeat task      │  events    │ calculate_metrics        │
//!  │ ChunkScheduler           │──────────► │   └─ velocity, ETA       │
//!  │   ├─ replay()            │  .jsonl    │ cleanup_telemetry        │
//!  │   └─ run_pass(worker)    │            │   └─ retention           │
//!  └──────────────────────────┘            └──────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use transcript_ledger::{ChunkScheduler, EventEmitter, LedgerConfig};
//!
//! let config = LedgerConfig::from_env()?;
//! let job_dir = config.job_output_dir("my-book");
//! let emitter = EventEmitter::for_job("my-book", &config, &job_dir)?;
//! emitter.start_heartbeat(total_pages);
//!
//! emitter
//!     .job(started, shutdown, |progress| async move {
//!         let slots = job_dir.join(".pdf-progress");
//!         let mut scheduler = ChunkScheduler::open(emitter.clone(), slots)?;
//!         scheduler.run_pass(&worker, config.chunk_size).await?;
//!         scheduler.sync_progress(&progress);
//!         Ok::<_, anyhow::Error>(scheduler.assemble_output()?)
//!     })
//!     .await?;
//! ```
//!
//! # Modules
//!
//! - [`events`] - Event schema and the append-only log
//! - [`emitter`] - Event emission, heartbeat and the job wrapper
//! - [`state`] - Replay, chunk scheduling and the pass driver
//! - [`monitor`] - Job discovery and throughput metrics
//! - [`retention`] - Deleting logs of finished jobs
//! - [`config`] - Defaults and environment overrides
//! - [`testing`] - Fixture logs and scripted workers

pub mod config;
pub mod emitter;
pub mod error;
pub mod events;
pub mod monitor;
pub mod retention;
pub mod state;
pub mod testing;

pub use config::LedgerConfig;
pub use emitter::{
    EmitterBuilder, EventEmitter, JobError, JobProgress, ProcessSampler, ResourceSample,
    ResourceSampler,
};
pub use error::{LedgerError, Result};
pub use events::{
    read_events, ErrorEvent, Event, EventKind, EventLog, Heartbeat, JobCompleted, JobStarted,
    PageCompleted, Severity,
};
pub use monitor::{
    calculate_metrics, discover_jobs, format_completion_time, format_elapsed, format_eta,
    JobInfo, JobMetrics, Liveness,
};
pub use retention::{cleanup_telemetry, CleanupReport, KeepReason};
pub use state::{
    replay, replay_log, validate_recent_pages, ChunkScheduler, PageOutput, PageReport,
    PageWorker, PassSummary, ProgressSummary, TranscriptionState,
};
