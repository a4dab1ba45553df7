//! Event schema.
//!
//! Every line in a job's log is one [`Event`]: a timestamp, the job id and
//! one of five payloads discriminated by `event_type`.
//!
//! ```text
//! {"timestamp":"2025-01-06T10:30:00.000000Z","job_id":"book","event_type":"page_completed",
//!  "page_number":3,"duration_ms":8120,"hallucination_detected":false,
//!  "fallback_used":null,"verification_error":null}
//! ```
//!
//! Fields marked `#[serde(default)]` may be absent in older logs and take
//! their documented default on read. Optional fields are always written,
//! as `null` when unset.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single record in a job's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// The five event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    JobStarted(JobStarted),
    PageCompleted(PageCompleted),
    Heartbeat(Heartbeat),
    /// Errors and warnings share one tag; `severity` tells them apart.
    #[serde(rename = "error", alias = "warning")]
    Error(ErrorEvent),
    JobCompleted(JobCompleted),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStarted {
    pub pdf_path: String,
    pub output_dir: String,
    pub total_pages: u32,
    pub quality: String,
    pub mode: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCompleted {
    pub page_number: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub hallucination_detected: bool,
    /// Backend that produced the page when the primary one failed.
    #[serde(default)]
    pub fallback_used: Option<String>,
    #[serde(default)]
    pub verification_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub current_page: u32,
    pub total_pages: u32,
    #[serde(default)]
    pub pages_completed_since_last_heartbeat: u32,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub severity: Severity,
    pub error_type: String,
    pub error_message: String,
    #[serde(default)]
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub total_pages: u32,
    pub pages_completed: u32,
    pub pages_failed: u32,
    #[serde(default)]
    pub total_duration_seconds: f64,
    #[serde(default)]
    pub avg_velocity_pages_per_hour: f64,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub warning_count: u32,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn now(job_id: impl Into<String>, kind: EventKind) -> Self {
        Self::at(now_micros(), job_id, kind)
    }

    /// Create an event with an explicit timestamp.
    pub fn at(timestamp: DateTime<Utc>, job_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp,
            job_id: job_id.into(),
            kind,
        }
    }

    /// The wire discriminator for this event.
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    /// Convert to a JSON object.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// Parse from a JSON object.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// Encode as a single newline-terminated log line.
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one log line (surrounding whitespace ignored).
    pub fn from_json_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::JobStarted(_) => "job_started",
            EventKind::PageCompleted(_) => "page_completed",
            EventKind::Heartbeat(_) => "heartbeat",
            EventKind::Error(_) => "error",
            EventKind::JobCompleted(_) => "job_completed",
        }
    }

    /// Page the event refers to, if any.
    pub fn page_number(&self) -> Option<u32> {
        match self {
            EventKind::PageCompleted(p) => Some(p.page_number),
            EventKind::Error(e) => e.page_number,
            EventKind::JobStarted(_) | EventKind::Heartbeat(_) | EventKind::JobCompleted(_) => {
                None
            }
        }
    }
}

impl PageCompleted {
    /// A clean completion with no fallback or verification issue.
    pub fn new(page_number: u32, duration_ms: u64) -> Self {
        Self {
            page_number,
            duration_ms,
            hallucination_detected: false,
            fallback_used: None,
            verification_error: None,
        }
    }
}

impl ErrorEvent {
    pub fn error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            error_type: error_type.into(),
            error_message: message.into(),
            page_number: None,
        }
    }

    pub fn warning(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(error_type, message)
        }
    }

    pub fn on_page(mut self, page: u32) -> Self {
        self.page_number = Some(page);
        self
    }
}

macro_rules! impl_from_payload {
    ($($payload:ident => $variant:ident),* $(,)?) => {
        $(impl From<$payload> for EventKind {
            fn from(payload: $payload) -> Self {
                EventKind::$variant(payload)
            }
        })*
    };
}

impl_from_payload! {
    JobStarted => JobStarted,
    PageCompleted => PageCompleted,
    Heartbeat => Heartbeat,
    ErrorEvent => Error,
    JobCompleted => JobCompleted,
}

/// Current time at the precision the log stores.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Timestamps are written as `YYYY-MM-DDTHH:MM:SS.ffffffZ`.
///
/// Reading accepts any RFC 3339 offset, and naive timestamps are taken as UTC.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&ts.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}
