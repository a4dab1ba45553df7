//! Ledger configuration.
//!
//! Defaults match the transcriber's long-standing behavior. Every field can
//! be overridden with a builder, and the commonly tuned ones can also come
//! from `PDF_TRANSCRIBER_*` environment variables (a `.env` file is honored).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dotenvy::dotenv;

use crate::error::{LedgerError, Result};

/// Environment variable prefix shared with the transcriber.
pub const ENV_PREFIX: &str = "PDF_TRANSCRIBER_";

/// Name of the per-job alias that points at the central event log.
pub const EVENT_LOG_LINK: &str = "events.jsonl";

/// Name of the per-job directory holding page slots.
pub const PROGRESS_DIR: &str = ".pdf-progress";

/// Configuration for emitting, scheduling and monitoring jobs.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Central store for event logs (`<job_id>.jsonl`).
    pub telemetry_dir: PathBuf,

    /// Root under which each job gets its own output directory.
    pub output_dir: PathBuf,

    /// How often the background heartbeat samples and emits.
    ///
    /// Default: 30s.
    pub heartbeat_interval: Duration,

    /// Upper bound on waiting for the heartbeat task to exit.
    ///
    /// Default: 2s.
    pub heartbeat_stop_timeout: Duration,

    /// Heartbeat age after which an active job is reported as stalled.
    ///
    /// Default: 120s.
    pub stale_threshold: Duration,

    /// Pages per chunk. Zero or negative disables chunking.
    pub chunk_size: i64,

    /// Number of recent page completions used for velocity.
    pub velocity_window: usize,

    /// Minimum completions in the window before velocity is reported.
    pub min_pages_for_velocity: usize,

    /// Number of recent completions re-checked by the advisory validator.
    pub validation_count: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            telemetry_dir: default_telemetry_dir(),
            output_dir: default_output_dir(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_stop_timeout: Duration::from_secs(2),
            stale_threshold: Duration::from_secs(120),
            chunk_size: 1,
            velocity_window: 50,
            min_pages_for_velocity: 5,
            validation_count: 10,
        }
    }
}

impl LedgerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    ///
    /// `lookup` receives the full variable name (prefix included).
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(dir) = var("TELEMETRY_DIR") {
            config.telemetry_dir = expand_home(&dir);
        }
        if let Some(dir) = var("OUTPUT_DIR") {
            config.output_dir = expand_home(&dir);
        }
        if let Some(raw) = var("HEARTBEAT_SECS") {
            config.heartbeat_interval = parse_secs("HEARTBEAT_SECS", &raw)?;
        }
        if let Some(raw) = var("STALE_SECS") {
            config.stale_threshold = parse_secs("STALE_SECS", &raw)?;
        }
        if let Some(raw) = var("CHUNK_SIZE") {
            config.chunk_size = raw.trim().parse().map_err(|_| {
                LedgerError::InvalidConfig(format!("{ENV_PREFIX}CHUNK_SIZE must be an integer"))
            })?;
        }
        if let Some(raw) = var("VELOCITY_WINDOW") {
            config.velocity_window = match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(LedgerError::InvalidConfig(format!(
                        "{ENV_PREFIX}VELOCITY_WINDOW must be a positive integer"
                    )))
                }
            };
        }

        Ok(config)
    }

    pub fn with_telemetry_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.telemetry_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_stop_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_stop_timeout = timeout;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: i64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_velocity_window(mut self, window: usize, min_pages: usize) -> Self {
        self.velocity_window = window;
        self.min_pages_for_velocity = min_pages;
        self
    }

    /// Central log path for a job.
    pub fn event_log_path(&self, job_id: &str) -> PathBuf {
        self.telemetry_dir.join(format!("{job_id}.jsonl"))
    }

    /// Output directory for a job.
    pub fn job_output_dir(&self, job_id: &str) -> PathBuf {
        self.output_dir.join(job_id)
    }
}

fn parse_secs(name: &str, raw: &str) -> Result<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(LedgerError::InvalidConfig(format!(
            "{ENV_PREFIX}{name} must be a positive number of seconds, got {raw:?}"
        ))),
    }
}

pub(crate) fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    }
}

/// `~/.cache` on every platform, so the transcriber and monitor agree.
fn default_telemetry_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".cache"))
        .or_else(dirs::cache_dir)
        .unwrap_or_else(|| Path::new(".cache").to_path_buf())
        .join("pdf-transcriber")
        .join("telemetry")
}

fn default_output_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Transcriptions")
}
