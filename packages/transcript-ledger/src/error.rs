//! Typed errors for the ledger library.
//!
//! Only failures to *write* the log surface as errors. Read-side problems
//! (truncated trailing lines, unknown event types) are logged and skipped.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while recording or reconstructing job state.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Filesystem operation failed
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Event could not be encoded
    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),

    /// Page number outside `[1, total_pages]`
    #[error("page {page} is outside 1..={total_pages}")]
    PageOutOfRange { page: u32, total_pages: u32 },

    /// Event log has no `job_started` record
    #[error("event log is not resumable (no job_started): {}", .path.display())]
    NotResumable { path: PathBuf },

    /// Configuration value rejected
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl LedgerError {
    /// Wrap an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Attach a path to `std::io::Result` values.
pub(crate) trait IoContext<T> {
    fn at_path(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at_path(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| LedgerError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_names_path() {
        let err = LedgerError::io(
            "/tmp/job.jsonl",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/job.jsonl"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_page_out_of_range_message() {
        let err = LedgerError::PageOutOfRange {
            page: 12,
            total_pages: 10,
        };
        assert_eq!(err.to_string(), "page 12 is outside 1..=10");
    }
}
