#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};

/// Lifecycle state of a work queue job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl JobStatus {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }

    /// Terminal states never transition again.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

impl std::fmt::Display for JobStatus {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the shadow table: a 1:1 mirror of a source row identity
/// carrying its vector clock. Doc ids cross the wire as text regardless of
/// the configured id type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ShadowRow {
    pub id: i64,
    pub doc_id: String,
    pub vector_clock: i64,
}

/// One stored chunk. The embedding column is omitted here; consumers query
/// it with pgvector operators directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ChunkRow {
    pub id: i64,
    pub doc_id: String,
    pub vector_clock: i64,
    pub index: i32,
    pub chunk_hash: String,
    pub text: Option<String>,
    pub blob: Option<Vec<u8>>,
    pub json: Option<serde_json::Value>,
}

/// A durable directive to bring `doc_id` to `vector_clock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkQueueJob {
    pub id: i64,
    pub doc_id: String,
    pub vector_clock: i64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub error: Option<String>,
    pub retry_count: i32,
}

/// Per-status queue counts for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub total: i64,
    pub oldest_pending_age_seconds: Option<i64>,
}
