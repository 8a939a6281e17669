use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Started => write!(f, "STARTED"),
            RunStatus::Completed => write!(f, "COMPLETED"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// One execution attempt of a job. Immutable once recorded; run records
/// accumulate and are the authoritative execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub user_id: String,
    pub status: RunStatus,
    /// The picker's stamp at dispatch time.
    pub triggered_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Combined stdout+stderr, or a synthetic payload echo. Bounded.
    pub output: String,
    pub worker_id: String,
    pub error_message: String,
}
