use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::run::RunStatus;

/// Message the ingress publishes to the write-bus, keyed by `job_id`.
/// The queue writer materialises it into a dispatch-queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionEvent {
    pub job_id: Uuid,
    pub project_id: String,
    pub user_id: String,
    pub next_fire_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub shard_id: u32,
    /// Inline payload or blob reference, exactly as persisted.
    pub payload: String,
    pub max_retries: i32,
}

/// Message a picker publishes to the execution bus to hand a due job to a
/// worker. Carries everything the worker needs so no further enrichment
/// read is required on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub job_id: Uuid,
    /// Fresh per dispatch attempt; the idempotency key for run records.
    pub run_id: Uuid,
    pub status: RunStatus,
    pub executed_at: DateTime<Utc>,
    pub payload: String,
    pub project_id: String,
    pub user_id: String,
    pub cron_schedule: String,
    pub max_retries: i32,
}
