//! End-to-end tests for a job's life on disk.
//!
//! These tests drive the public API the way the transcriber and the
//! monitor do:
//! 1. Start a job and record pages through the scheduler
//! 2. Crash (drop everything without a terminal event) and resume
//! 3. Finish under the lifecycle wrapper
//! 4. Observe the job from the read side and retire its log

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{Duration as TimeDelta, TimeZone, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use transcript_ledger::{
    cleanup_telemetry,
    config::{EVENT_LOG_LINK, PROGRESS_DIR},
    discover_jobs,
    events::read_events,
    monitor::{discover_jobs_at, metrics_from_events},
    replay,
    testing::{FixedSampler, LogBuilder, ScriptedWorker},
    ChunkScheduler, EventEmitter, EventKind, JobError, JobStarted, LedgerConfig, LedgerError,
    Liveness,
};

const JOB: &str = "field-notes";

fn config(dir: &TempDir) -> LedgerConfig {
    LedgerConfig::default()
        .with_telemetry_dir(dir.path().join("telemetry"))
        .with_output_dir(dir.path().join("out"))
}

fn emitter(config: &LedgerConfig) -> EventEmitter {
    EventEmitter::builder(JOB, config.event_log_path(JOB))
        .link_into(config.job_output_dir(JOB))
        .sampler(FixedSampler::new(3.0, 128.0))
        .build()
        .unwrap()
}

fn started(config: &LedgerConfig, total_pages: u32) -> JobStarted {
    JobStarted {
        pdf_path: "/books/field-notes.pdf".into(),
        output_dir: config.job_output_dir(JOB).display().to_string(),
        total_pages,
        quality: "balanced".into(),
        mode: "streaming".into(),
        metadata: Default::default(),
    }
}

fn event_types(path: &Path) -> Vec<&'static str> {
    read_events(path)
        .unwrap()
        .iter()
        .map(|e| e.event_type())
        .collect()
}

#[test]
fn test_next_chunk_skips_completed_pages() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let emitter = emitter(&config);
    emitter.emit_job_started(started(&config, 5)).unwrap();

    let mut scheduler =
        ChunkScheduler::open(emitter, config.job_output_dir(JOB).join(PROGRESS_DIR)).unwrap();
    for page in 1..=3 {
        scheduler.mark_page_complete(page, "text").unwrap();
    }

    assert_eq!(scheduler.next_chunk(2), vec![4, 5]);
}

#[tokio::test]
async fn test_crash_then_resume_finishes_remaining_pages() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let job_dir = config.job_output_dir(JOB);
    let pages_dir = job_dir.join(PROGRESS_DIR);

    // First process: three pages, then a crash with no terminal event.
    {
        let emitter = emitter(&config);
        emitter.emit_job_started(started(&config, 6)).unwrap();
        let mut scheduler = ChunkScheduler::open(emitter, &pages_dir).unwrap();
        for page in [2, 1, 3] {
            scheduler.mark_page_complete(page, &format!("page {page}")).unwrap();
        }
        scheduler.mark_page_failed(4, "timeout").unwrap();
    }

    let before = replay(&read_events(&config.event_log_path(JOB)).unwrap()).unwrap();
    assert_eq!(before.pending_pages(), vec![4, 5, 6]);
    assert!(before.failed_pages.contains(&4));

    // Second process: resume under the lifecycle wrapper.
    let emitter = emitter(&config);
    let worker = ScriptedWorker::new();
    let task_worker = worker.clone();
    let resumed = emitter.clone();
    let resume_dir = pages_dir.clone();
    let output = emitter
        .job(
            started(&config, 6),
            CancellationToken::new(),
            |progress| async move {
                let mut scheduler = ChunkScheduler::open(resumed, &resume_dir)?;
                scheduler.run_pass(&task_worker, 2).await?;
                scheduler.sync_progress(&progress);
                scheduler.assemble_output_with(false)
            },
        )
        .await
        .unwrap();

    assert_eq!(worker.calls(), vec![vec![4, 5], vec![6]]);
    assert_eq!(
        output,
        "page 1\n\n---\n\npage 2\n\n---\n\npage 3\n\n---\n\npage 4\n\n---\n\npage 5\n\n---\n\npage 6"
    );

    let events = read_events(&config.event_log_path(JOB)).unwrap();
    let EventKind::JobCompleted(done) = &events.last().unwrap().kind else {
        panic!("expected terminal event last");
    };
    assert_eq!((done.pages_completed, done.pages_failed), (6, 0));
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type() == "job_completed")
            .count(),
        1
    );

    let jobs = discover_jobs(&config.output_dir, config.stale_threshold).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].liveness(), Liveness::Completed);
    assert_eq!(jobs[0].pages_completed, 6);
}

#[tokio::test]
async fn test_failing_body_records_failure_before_terminal_event() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let emitter = emitter(&config);

    let err = emitter
        .job(started(&config, 10), CancellationToken::new(), |progress| async move {
            progress.set_pages_completed(3);
            progress.set_pages_failed(1);
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "renderer crashed"))
        })
        .await
        .unwrap_err();

    let JobError::Body(io_err) = err else {
        panic!("expected body error");
    };
    assert_eq!(io_err.to_string(), "renderer crashed");

    let events = read_events(&config.event_log_path(JOB)).unwrap();
    assert_eq!(
        events.iter().map(|e| e.event_type()).collect::<Vec<_>>(),
        ["job_started", "error", "job_completed"]
    );
    let EventKind::Error(failure) = &events[1].kind else {
        panic!("expected error event");
    };
    assert_eq!(failure.error_type, "transcription_failure");
    let EventKind::JobCompleted(done) = &events[2].kind else {
        panic!("expected job_completed");
    };
    assert_eq!((done.total_pages, done.pages_completed, done.pages_failed), (10, 3, 1));
}

#[tokio::test]
async fn test_heartbeat_visible_to_discovery() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let emitter = EventEmitter::builder(JOB, config.event_log_path(JOB))
        .link_into(config.job_output_dir(JOB))
        .sampler(FixedSampler::new(3.0, 128.0))
        .heartbeat_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    emitter.emit_job_started(started(&config, 4)).unwrap();
    emitter.update_current_page(2);
    emitter.start_heartbeat(4);

    tokio::time::sleep(Duration::from_millis(120)).await;
    emitter.stop_heartbeat().await;

    let jobs = discover_jobs(&config.output_dir, config.stale_threshold).unwrap();
    let job = &jobs[0];
    assert_eq!(job.liveness(), Liveness::Active);
    assert_eq!(job.current_page, 2);
    assert_eq!(job.cpu_percent, 3.0);
    assert_eq!(job.memory_mb, 128.0);
    assert!(job.last_heartbeat.is_some());

    let later = job.last_heartbeat.unwrap() + TimeDelta::seconds(200);
    let stalled = discover_jobs_at(&config.output_dir, config.stale_threshold, later).unwrap();
    assert_eq!(stalled[0].liveness(), Liveness::Stalled);
}

#[test]
fn test_stalled_job_from_fixture_log() {
    let dir = TempDir::new().unwrap();
    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
    LogBuilder::new("stuck", t0)
        .started(40)
        .page_at(TimeDelta::seconds(50), 1)
        .heartbeat_at(TimeDelta::seconds(60), 1, 40)
        .write_job(dir.path());

    let now = t0 + TimeDelta::seconds(260);
    let jobs = discover_jobs_at(dir.path(), Duration::from_secs(120), now).unwrap();
    assert_eq!(jobs[0].liveness(), Liveness::Stalled);
}

#[test]
fn test_output_artifact_marks_job_completed() {
    let dir = TempDir::new().unwrap();
    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
    let job_dir = LogBuilder::new("dropped-terminal", t0)
        .started(2)
        .page_at(TimeDelta::seconds(5), 1)
        .page_at(TimeDelta::seconds(9), 2)
        .write_job(dir.path());
    let artifact = job_dir.join("dropped-terminal.md");
    fs::write(&artifact, "# Done").unwrap();
    let mtime = fs::metadata(&artifact).unwrap().modified().unwrap();

    let jobs = discover_jobs(dir.path(), Duration::from_secs(120)).unwrap();
    assert_eq!(jobs[0].liveness(), Liveness::Completed);
    assert_eq!(jobs[0].completed_at, Some(mtime.into()));
}

#[test]
fn test_velocity_over_one_hour_window() {
    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
    let mut builder = LogBuilder::new("steady", t0).started(100);
    for i in 0..5 {
        builder = builder.page_at(TimeDelta::minutes(10 + 15 * i), i as u32 + 1);
    }

    let metrics = metrics_from_events(&builder.events(), 50, 5, t0 + TimeDelta::hours(2)).unwrap();
    assert_eq!(metrics.velocity, 5.0);
    assert_eq!(metrics.window_size, 5);
}

#[test]
fn test_log_without_job_started_is_not_resumable() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let emitter = emitter(&config);
    emitter
        .emit_page_completed(transcript_ledger::PageCompleted::new(1, 10))
        .unwrap();

    let err = ChunkScheduler::open(emitter, dir.path().join("pages")).err().unwrap();
    assert!(matches!(err, LedgerError::NotResumable { .. }));
}

#[tokio::test]
async fn test_retention_after_final_output() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let job_dir = config.job_output_dir(JOB);
    let emitter = emitter(&config);

    emitter
        .job(started(&config, 1), CancellationToken::new(), |progress| async move {
            progress.record_completed();
            Ok::<(), std::io::Error>(())
        })
        .await
        .unwrap();

    // Terminal event alone is not enough.
    let report = cleanup_telemetry(&config.telemetry_dir, false).unwrap();
    assert_eq!(report.logs_deleted(), 0);
    assert!(config.event_log_path(JOB).exists());

    fs::write(job_dir.join(format!("{JOB}.md")), "# Field Notes").unwrap();
    let report = cleanup_telemetry(&config.telemetry_dir, false).unwrap();
    assert_eq!(report.logs_deleted(), 1);
    assert!(!config.event_log_path(JOB).exists());
    assert!(fs::symlink_metadata(job_dir.join(EVENT_LOG_LINK)).is_err());
    assert_eq!(event_types(&config.event_log_path(JOB)), Vec::<&str>::new());
}
