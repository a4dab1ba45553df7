//! Append-only JSONL event log.
//!
//! # Write path
//!
//! ```text
//! EventLog::append(job_id, kind)
//!     │
//!     ├─► lock writer (one writer per job)
//!     ├─► stamp: max(now, previous stamp)
//!     └─► open(append) + write one line
//! ```
//!
//! The file is never truncated or rewritten. Lines already on disk are
//! therefore immutable, and the only damage a crash can leave behind is a
//! partially written final line.
//!
//! # Read path
//!
//! [`read_events`] tolerates exactly that damage: blank lines are skipped,
//! and lines that fail to parse (truncated tail, unknown `event_type`) are
//! logged at `warn` with their line number and skipped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::warn;

use super::schema::{now_micros, Event, EventKind};
use crate::error::{IoContext, Result};

/// Single-writer handle on a job's event log.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    /// Serializes appends and carries the last stamp handed out.
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl EventLog {
    /// Open (creating the parent directory) a log for appending.
    ///
    /// The file itself is created on the first append.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).at_path(parent)?;
        }
        Ok(Self {
            path,
            last_stamp: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamp and append one event, returning what was written.
    pub fn append(&self, job_id: &str, kind: EventKind) -> Result<Event> {
        let mut last = self
            .last_stamp
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut stamp = now_micros();
        if let Some(prev) = *last {
            stamp = stamp.max(prev);
        }

        let event = Event::at(stamp, job_id, kind);
        self.write_line(&event)?;
        *last = Some(stamp);
        Ok(event)
    }

    /// Append a pre-built event verbatim.
    ///
    /// Used for fixtures and imports; the caller owns timestamp ordering.
    pub fn append_event(&self, event: &Event) -> Result<()> {
        let mut last = self
            .last_stamp
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.write_line(event)?;
        *last = Some(last.map_or(event.timestamp, |prev| prev.max(event.timestamp)));
        Ok(())
    }

    /// Flush everything appended so far to stable storage.
    pub fn sync(&self) -> Result<()> {
        let _guard = self
            .last_stamp
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match File::open(&self.path) {
            Ok(file) => file.sync_all().at_path(&self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).at_path(&self.path),
        }
    }

    /// Read back every well-formed event.
    pub fn read(&self) -> Result<Vec<Event>> {
        read_events(&self.path)
    }

    fn write_line(&self, event: &Event) -> Result<()> {
        let line = event.to_json_line()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .at_path(&self.path)?;
        file.write_all(line.as_bytes()).at_path(&self.path)?;
        file.flush().at_path(&self.path)
    }
}

/// Read all parseable events from a log file, in file order.
///
/// A missing file reads as empty. Any other I/O failure is an error.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).at_path(path),
    };
    Ok(parse_events(&String::from_utf8_lossy(&bytes), path))
}

/// Parse JSONL text, skipping blank and malformed lines.
pub fn parse_events(text: &str, source: &Path) -> Vec<Event> {
    let mut events = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match Event::from_json_line(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(
                    path = %source.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping unreadable event log line"
                );
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::schema::{ErrorEvent, PageCompleted};
    use tempfile::TempDir;

    #[test]
    fn test_append_creates_file_and_parent() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::create(dir.path().join("telemetry/book.jsonl")).unwrap();
        assert!(log.read().unwrap().is_empty());

        log.append("book", PageCompleted::new(1, 100).into()).unwrap();
        log.append("book", ErrorEvent::warning("slow", "took 90s").into())
            .unwrap();

        let events = log.read().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), "page_completed");
        assert_eq!(events[1].event_type(), "error");
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::create(dir.path().join("book.jsonl")).unwrap();
        for page in 1..=50 {
            log.append("book", PageCompleted::new(page, 1).into()).unwrap();
        }
        let events = log.read().unwrap();
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_append_never_rewrites_existing_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.jsonl");
        let log = EventLog::create(&path).unwrap();
        log.append("book", PageCompleted::new(1, 1).into()).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        log.append("book", PageCompleted::new(2, 1).into()).unwrap();
        let after = fs::read_to_string(&path).unwrap();
        assert!(after.starts_with(&before));
        assert_eq!(after.lines().count(), 2);
    }

    #[test]
    fn test_read_skips_truncated_tail_and_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.jsonl");
        let log = EventLog::create(&path).unwrap();
        log.append("book", PageCompleted::new(1, 1).into()).unwrap();
        log.append("book", PageCompleted::new(2, 1).into()).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"\n   \nnot json\n{\"timestamp\":\"2025-01-06T10:")
            .unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_events(&dir.path().join("nope.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_sync_without_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::create(dir.path().join("book.jsonl")).unwrap();
        log.sync().unwrap();
    }
}
