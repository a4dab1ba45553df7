//! Read-only monitoring views: job discovery and throughput metrics.
//!
//! Nothing here writes to a log. Both views tolerate logs that are being
//! appended to while they read.

pub mod discovery;
pub mod metrics;

pub use discovery::{discover_jobs, discover_jobs_at, sort_for_display, JobInfo, Liveness};
pub use metrics::{
    calculate_metrics, calculate_metrics_at, format_completion_time, format_elapsed, format_eta,
    metrics_from_events, rolling_velocity, JobMetrics,
};
