//! Job records and the client-visible event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// What a job does. Only generation exists today; the enum keeps the wire
/// format stable if more types are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Image generation via the upstream worker.
    Generate,
}

impl JobKind {
    /// Stable string form used in storage and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in its owner's queue.
    Queued,
    /// Picked up by the worker.
    Running,
    /// Finished successfully; progress is 100.
    Complete,
    /// Finished with an error.
    Error,
    /// Cancelled before or during execution.
    Cancelled,
}

impl JobStatus {
    /// Whether this state ends the lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    /// Stable string form used in storage and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work for one owner.
///
/// Created on enqueue, mutated exclusively by the scheduler worker loop,
/// never deleted from the in-memory registry. Snapshots flow to the job
/// store on every emitted event.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// Opaque job id (uuid hex).
    pub id: String,
    /// Owning anonymous user id; immutable.
    pub owner_id: String,
    /// Job type.
    #[serde(rename = "type")]
    pub kind: JobKind,
    /// Opaque recipe consumed by the generation pipeline.
    pub payload: Value,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Progress in percent, 0..=100. Exactly 100 iff complete.
    pub progress: f64,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the worker picked it up.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Error message for `error`/`cancelled` terminals.
    pub error_message: Option<String>,
    /// Result map; includes `image_path` on success.
    pub result: Map<String, Value>,
}

impl Job {
    /// Create a freshly queued job.
    #[must_use]
    pub fn new(owner_id: String, kind: JobKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            owner_id,
            kind,
            payload,
            status: JobStatus::Queued,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error_message: None,
            result: Map::new(),
        }
    }

    /// Workflow id from the payload, when present.
    #[must_use]
    pub fn workflow_id(&self) -> Option<&str> {
        self.payload.get("workflow_id").and_then(Value::as_str)
    }

    /// Duration in seconds between start and end, when both are set.
    #[must_use]
    pub fn duration_secs(&self) -> Option<f64> {
        let (start, end) = (self.started_at?, self.ended_at?);
        let ms = (end - start).num_milliseconds();
        Some((ms as f64 / 1000.0).max(0.0))
    }
}

/// Client-visible event for a single job, delivered over the status
/// WebSocket. For a given job the emitted sequence is always a prefix of
/// `queued, running, progress*, cancelling?, terminal`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobEvent {
    /// Accepted into the owner's queue.
    Queued {
        /// Job id.
        job_id: String,
        /// Zero-based position in the owner's queue.
        position: usize,
    },
    /// Picked up, or progress advanced.
    Running {
        /// Job id.
        job_id: String,
        /// Progress in percent.
        progress: f64,
    },
    /// A cancel or timeout was delivered to the upstream; terminal state
    /// follows once the session winds down.
    Cancelling {
        /// Job id.
        job_id: String,
    },
    /// Finished successfully.
    Complete {
        /// Job id.
        job_id: String,
        /// Result fields, flattened into the event (e.g. `image_path`).
        #[serde(flatten)]
        result: Map<String, Value>,
    },
    /// Cancelled.
    Cancelled {
        /// Job id.
        job_id: String,
        /// Friendly cancellation message, when the job was already running.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Failed.
    Error {
        /// Job id.
        job_id: String,
        /// User-presentable error message.
        error: String,
    },
}

impl JobEvent {
    /// The job this event belongs to.
    #[must_use]
    pub fn job_id(&self) -> &str {
        match self {
            Self::Queued { job_id, .. }
            | Self::Running { job_id, .. }
            | Self::Cancelling { job_id }
            | Self::Complete { job_id, .. }
            | Self::Cancelled { job_id, .. }
            | Self::Error { job_id, .. } => job_id,
        }
    }
}
