//! Retention of central event logs.
//!
//! A log is deleted only when both hold:
//! 1. it contains a `job_completed` event, and
//! 2. the output directory named by its `job_started` holds a final `.md`
//!    (a `*.original.md` backup does not count).
//!
//! Anything else (active, crashed, unreadable) is kept. When a log is
//! deleted, the job directory's `events.jsonl` link is removed too, but
//! only if it resolves to that same log.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::config::{expand_home, EVENT_LOG_LINK};
use crate::error::{IoContext, Result};
use crate::events::{read_events, EventKind};

/// Why a log was kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepReason {
    /// No `job_completed` event (active or crashed job)
    NotCompleted,
    /// No `job_started` event naming the output directory
    UnknownOutputDir,
    /// No final output in the job's output directory
    NoFinalOutput(PathBuf),
    /// The log could not be read or deleted
    Failed,
}

impl fmt::Display for KeepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepReason::NotCompleted => {
                f.write_str("no job_completed event (active or failed job)")
            }
            KeepReason::UnknownOutputDir => f.write_str("cannot determine output directory"),
            KeepReason::NoFinalOutput(dir) => {
                write!(f, "final output not found in {}", dir.display())
            }
            KeepReason::Failed => f.write_str("error while processing"),
        }
    }
}

/// A log selected for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedLog {
    pub log: PathBuf,
    pub final_output: PathBuf,
    /// Job directory link removed alongside the log.
    pub link: Option<PathBuf>,
}

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub total_logs_found: usize,
    pub deleted: Vec<DeletedLog>,
    pub kept: Vec<(PathBuf, KeepReason)>,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn logs_deleted(&self) -> usize {
        self.deleted.len()
    }

    pub fn logs_kept(&self) -> usize {
        self.kept.len()
    }
}

/// Sweep `telemetry_dir`, deleting logs of finished jobs.
///
/// With `dry_run`, nothing is removed but the report lists the same
/// decisions.
pub fn cleanup_telemetry(telemetry_dir: &Path, dry_run: bool) -> Result<CleanupReport> {
    let mut report = CleanupReport {
        dry_run,
        ..Default::default()
    };

    let entries = match fs::read_dir(telemetry_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %telemetry_dir.display(), "telemetry directory does not exist");
            return Ok(report);
        }
        Err(e) => return Err(e).at_path(telemetry_dir),
    };

    let mut logs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl") && path.is_file())
        .collect();
    logs.sort();
    report.total_logs_found = logs.len();

    for log in logs {
        match sweep_one(&log, dry_run) {
            Ok(Decision::Delete(deleted)) => {
                info!(
                    log = %log.display(),
                    output = %deleted.final_output.display(),
                    dry_run,
                    "deleting event log of finished job"
                );
                report.deleted.push(deleted);
            }
            Ok(Decision::Keep(reason)) => {
                debug!(log = %log.display(), reason = %reason, "keeping event log");
                report.kept.push((log, reason));
            }
            Err(e) => {
                let name = log
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                error!(log = %log.display(), error = %e, "retention failed");
                report.errors.push(format!("error processing {name}: {e}"));
                report.kept.push((log, KeepReason::Failed));
            }
        }
    }

    Ok(report)
}

enum Decision {
    Delete(DeletedLog),
    Keep(KeepReason),
}

fn sweep_one(log: &Path, dry_run: bool) -> Result<Decision> {
    let events = read_events(log)?;

    let completed = events
        .iter()
        .any(|e| matches!(e.kind, EventKind::JobCompleted(_)));
    if !completed {
        return Ok(Decision::Keep(KeepReason::NotCompleted));
    }

    let Some(output_dir) = events.iter().find_map(|e| match &e.kind {
        EventKind::JobStarted(started) => Some(expand_home(&started.output_dir)),
        _ => None,
    }) else {
        return Ok(Decision::Keep(KeepReason::UnknownOutputDir));
    };

    let Some(final_output) = find_final_output(&output_dir) else {
        return Ok(Decision::Keep(KeepReason::NoFinalOutput(output_dir)));
    };

    let link = link_to(log, &output_dir);
    if !dry_run {
        fs::remove_file(log).at_path(log)?;
        if let Some(link) = &link {
            fs::remove_file(link).at_path(link)?;
        }
    }

    Ok(Decision::Delete(DeletedLog {
        log: log.to_path_buf(),
        final_output,
        link,
    }))
}

/// First final `.md` in `dir`, ignoring `*.original.md` backups.
pub fn find_final_output(dir: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            name.ends_with(".md") && !name.ends_with(".original.md") && path.is_file()
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// The job directory's link, if it resolves to `log`.
fn link_to(log: &Path, output_dir: &Path) -> Option<PathBuf> {
    let link = output_dir.join(EVENT_LOG_LINK);
    if !fs::symlink_metadata(&link).ok()?.file_type().is_symlink() {
        return None;
    }
    let target = fs::canonicalize(&link).ok()?;
    let log = fs::canonicalize(log).ok()?;
    (target == log).then_some(link)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::LogBuilder;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        telemetry: PathBuf,
        output: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let telemetry = dir.path().join("telemetry");
        let output = dir.path().join("out");
        fs::create_dir_all(&telemetry).unwrap();
        fs::create_dir_all(&output).unwrap();
        Fixture {
            _dir: dir,
            telemetry,
            output,
        }
    }

    fn job(fx: &Fixture, id: &str, completed: bool) -> (PathBuf, PathBuf) {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
        let job_dir = fx.output.join(id);
        let mut builder = LogBuilder::new(id, t0)
            .started_in(2, &job_dir)
            .page_at(Duration::seconds(1), 1);
        if completed {
            builder = builder.completed_at(Duration::seconds(2), 2, 1, 0, 0);
        }
        let log = builder.write_linked(&fx.telemetry, &job_dir);
        (log, job_dir)
    }

    #[test]
    fn test_deletes_finished_job_and_its_link() {
        let fx = fixture();
        let (log, job_dir) = job(&fx, "done", true);
        fs::write(job_dir.join("done.md"), "# Done").unwrap();

        let report = cleanup_telemetry(&fx.telemetry, false).unwrap();
        assert_eq!(report.total_logs_found, 1);
        assert_eq!(report.logs_deleted(), 1);
        assert_eq!(report.deleted[0].link, Some(job_dir.join(EVENT_LOG_LINK)));
        assert!(!log.exists());
        assert!(fs::symlink_metadata(job_dir.join(EVENT_LOG_LINK)).is_err());
        assert!(job_dir.join("done.md").exists());
    }

    #[test]
    fn test_keeps_unfinished_and_unverified_jobs() {
        let fx = fixture();
        let (running, _) = job(&fx, "running", false);
        fs::write(fx.output.join("running/running.md"), "partial").unwrap();
        let (no_output, job_dir) = job(&fx, "no-output", true);
        fs::write(job_dir.join("no-output.original.md"), "backup").unwrap();

        let report = cleanup_telemetry(&fx.telemetry, false).unwrap();
        assert_eq!(report.logs_deleted(), 0);
        assert_eq!(report.logs_kept(), 2);
        assert!(running.exists());
        assert!(no_output.exists());
        assert!(report
            .kept
            .iter()
            .any(|(p, r)| p == &running && *r == KeepReason::NotCompleted));
        assert!(report
            .kept
            .iter()
            .any(|(p, r)| p == &no_output && matches!(r, KeepReason::NoFinalOutput(_))));
    }

    #[test]
    fn test_dry_run_deletes_nothing() {
        let fx = fixture();
        let (log, job_dir) = job(&fx, "done", true);
        fs::write(job_dir.join("done.md"), "# Done").unwrap();

        let report = cleanup_telemetry(&fx.telemetry, true).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.logs_deleted(), 1);
        assert!(log.exists());
        assert!(fs::symlink_metadata(job_dir.join(EVENT_LOG_LINK)).is_ok());
    }

    #[test]
    fn test_foreign_link_is_left_alone() {
        let fx = fixture();
        let (log, job_dir) = job(&fx, "done", true);
        fs::write(job_dir.join("done.md"), "# Done").unwrap();
        let other = fx.telemetry.join("other.txt");
        fs::write(&other, "").unwrap();
        let link = job_dir.join(EVENT_LOG_LINK);
        fs::remove_file(&link).unwrap();
        std::os::unix::fs::symlink(&other, &link).unwrap();

        let report = cleanup_telemetry(&fx.telemetry, false).unwrap();
        assert_eq!(report.deleted[0].link, None);
        assert!(!log.exists());
        assert!(fs::symlink_metadata(&link).is_ok());
    }

    #[test]
    fn test_log_without_job_started_is_kept() {
        let fx = fixture();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
        let log = LogBuilder::new("orphan", t0)
            .completed_at(Duration::seconds(1), 1, 1, 0, 0)
            .write_to(&fx.telemetry.join("orphan.jsonl"));

        let report = cleanup_telemetry(&fx.telemetry, false).unwrap();
        assert_eq!(report.kept, vec![(log, KeepReason::UnknownOutputDir)]);
    }

    #[test]
    fn test_missing_dir_is_empty_report() {
        let fx = fixture();
        let report = cleanup_telemetry(&fx.telemetry.join("nope"), false).unwrap();
        assert_eq!(report.total_logs_found, 0);
    }
}
