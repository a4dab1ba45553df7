//! Event schema and the append-only log that stores it.

pub mod log;
pub mod schema;

pub use log::{parse_events, read_events, EventLog};
pub use schema::{
    now_micros, ErrorEvent, Event, EventKind, Heartbeat, JobCompleted, JobStarted, PageCompleted,
    Severity,
};
