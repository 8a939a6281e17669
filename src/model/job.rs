use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix marking a payload that has been offloaded to the blob store.
pub const BLOB_REF_PREFIX: &str = "blob:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Durable definition and schedule state of a job.
///
/// For a PENDING job exactly one queue row exists with matching
/// `(shard_id, next_fire_at, job_id)`; terminal one-shot jobs have none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub project_id: String,
    pub user_id: String,
    /// Inline bytes, or a `blob:payloads/<job_id>` reference once offloaded.
    pub payload: String,
    /// Recurrence expression; empty for one-shot jobs.
    pub cron_schedule: String,
    pub next_fire_at: DateTime<Utc>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub max_retries: i32,
    pub retry_count: i32,
    pub shard_id: u32,
}

impl Job {
    pub fn is_recurring(&self) -> bool {
        !self.cron_schedule.is_empty()
    }

    /// The queue row this job's schedule state corresponds to.
    pub fn queue_row(&self) -> QueueRow {
        QueueRow {
            shard_id: self.shard_id,
            next_fire_at: self.next_fire_at,
            job_id: self.job_id,
        }
    }
}

/// A row of the time-bucketed dispatch queue. Partition key is `shard_id`;
/// within a partition rows are ordered by `(next_fire_at, job_id)`.
/// Presence means "eligible for dispatch no earlier than `next_fire_at`".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueRow {
    pub shard_id: u32,
    pub next_fire_at: DateTime<Utc>,
    pub job_id: Uuid,
}

/// The fields a picker needs to enrich a queue row into a dispatch event.
/// Kept out of the queue row itself so the range scan stays cheap.
#[derive(Debug, Clone)]
pub struct DispatchFields {
    pub payload: String,
    pub project_id: String,
    pub cron_schedule: String,
    pub user_id: String,
    pub max_retries: i32,
}

/// Derive a shard id from a job id by uniform hash. The exact function is
/// arbitrary; the only requirement is rough uniformity over [0, shard_count).
pub fn shard_for(job_id: &Uuid, shard_count: u32) -> u32 {
    let bytes = job_id.as_bytes();
    let mut h: u64 = 0xcbf29ce484222325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    (h % shard_count as u64) as u32
}
