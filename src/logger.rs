//! Structured per-job event recording.
//!
//! A [`JobLogger`] is shared by all workers of a queue. Each job appends
//! its lifecycle events (and, at [`RecordLevel::Full`], the raw data its
//! session received) so a caller can inspect or export what happened on
//! every device after the run.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::workqueue::JobId;

/// Recording granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordLevel {
    /// Disable recording.
    #[default]
    Off,
    /// Record job lifecycle events only.
    KeyEventsOnly,
    /// Record lifecycle events and received session data.
    Full,
}

/// A single recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    JobStarted { name: String, attempt: usize },
    DataReceived { data: String },
    JobSucceeded,
    JobAborted { error: String },
}

/// A recorded event with its job and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobLogEntry {
    pub ts_ms: u128,
    pub job_id: JobId,
    pub event: JobEvent,
}

/// Thread-safe in-memory job event store.
#[derive(Debug, Clone)]
pub struct JobLogger {
    level: RecordLevel,
    entries: Arc<Mutex<Vec<JobLogEntry>>>,
}

impl JobLogger {
    /// Create a logger with the given level.
    pub fn new(level: RecordLevel) -> Self {
        Self {
            level,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Current recording level.
    pub fn level(&self) -> RecordLevel {
        self.level
    }

    /// Record a lifecycle event.
    pub fn record(&self, job_id: JobId, event: JobEvent) -> Result<(), FleetError> {
        if self.level == RecordLevel::Off {
            return Ok(());
        }
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| FleetError::InternalServerError(format!("record lock error: {e}")))?;
        guard.push(JobLogEntry {
            ts_ms: now_ms(),
            job_id,
            event,
        });
        Ok(())
    }

    /// Record data received by a job's session when enabled.
    pub fn record_data(&self, job_id: JobId, data: &str) -> Result<(), FleetError> {
        if self.level != RecordLevel::Full {
            return Ok(());
        }
        self.record(
            job_id,
            JobEvent::DataReceived {
                data: data.to_string(),
            },
        )
    }

    /// Snapshot all records.
    pub fn entries(&self) -> Result<Vec<JobLogEntry>, FleetError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| FleetError::InternalServerError(format!("record lock error: {e}")))?;
        Ok(guard.clone())
    }

    /// Events of one job, in recording order.
    pub fn job_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, FleetError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.job_id == job_id)
            .map(|entry| entry.event)
            .collect())
    }

    /// Concatenated session data per job.
    pub fn transcripts(&self) -> Result<BTreeMap<JobId, String>, FleetError> {
        let mut out: BTreeMap<JobId, String> = BTreeMap::new();
        for entry in self.entries()? {
            if let JobEvent::DataReceived { data } = entry.event {
                out.entry(entry.job_id).or_default().push_str(&data);
            }
        }
        Ok(out)
    }

    /// Clears all recorded events.
    pub fn clear(&self) -> Result<(), FleetError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| FleetError::InternalServerError(format!("record lock error: {e}")))?;
        guard.clear();
        Ok(())
    }

    /// Export records as JSONL.
    pub fn to_jsonl(&self) -> Result<String, FleetError> {
        let entries = self.entries()?;
        let mut lines = Vec::with_capacity(entries.len());
        for entry in entries {
            lines.push(serde_json::to_string(&entry)?);
        }
        Ok(lines.join("\n"))
    }

    /// Restore a logger from JSONL lines.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, FleetError> {
        let logger = Self::new(RecordLevel::Full);
        let mut parsed = Vec::new();
        for line in jsonl.lines() {
            if line.trim().is_empty() {
                continue;
            }
            parsed.push(serde_json::from_str::<JobLogEntry>(line)?);
        }

        let mut guard = logger
            .entries
            .lock()
            .map_err(|e| FleetError::InternalServerError(format!("record lock error: {e}")))?;
        *guard = parsed;
        drop(guard);

        Ok(logger)
    }
}

impl Default for JobLogger {
    fn default() -> Self {
        Self::new(RecordLevel::KeyEventsOnly)
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
