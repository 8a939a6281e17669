//! Trait seams for the durable collaborators: the job store (definitions,
//! schedule state, run history, user index), the time-bucketed dispatch
//! queue, and the payload blob store.
//!
//! The physical deployments are external; this module specifies their
//! contracts and ships embedded in-memory engines that honor them.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::job::DispatchFields;
use crate::model::{Job, JobStatus, QueueRow, RunRecord};

pub use memory::{MemoryBlobStore, MemoryDispatchQueue, MemoryJobStore};

/// One row of the per-user listing projection, clustered by
/// `(created_at, job_id)` under the user partition.
#[derive(Debug, Clone)]
pub struct UserJobEntry {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub next_fire_at: DateTime<Utc>,
}

/// Durable record of job definitions, run history, and the user index.
///
/// Writes are last-writer-wins; no compare-and-set is required anywhere in
/// the pipeline.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// The enrichment read the picker performs per candidate.
    async fn dispatch_fields(&self, job_id: Uuid) -> Result<Option<DispatchFields>>;

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<()>;

    /// Roll a recurring job forward: new fire instant, new shard, back to
    /// PENDING.
    async fn apply_reschedule(
        &self,
        job_id: Uuid,
        next_fire_at: DateTime<Utc>,
        shard_id: u32,
    ) -> Result<()>;

    /// All PENDING jobs, for the reconciliation sweep.
    async fn pending_jobs(&self) -> Result<Vec<Job>>;

    /// Record one execution attempt. Keyed by `(job_id, run_id)`; records
    /// are immutable once written.
    async fn record_run(&self, run: &RunRecord) -> Result<()>;

    async fn runs_for_job(&self, job_id: Uuid) -> Result<Vec<RunRecord>>;

    async fn upsert_user_job(&self, entry: &UserJobEntry) -> Result<()>;

    async fn user_jobs(&self, user_id: &str) -> Result<Vec<UserJobEntry>>;

    /// Update a user-index entry located via `(user_id, job_id)`; the engine
    /// recovers the clustering `created_at` itself.
    async fn update_user_job(
        &self,
        user_id: &str,
        job_id: Uuid,
        status: JobStatus,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// The partitioned, time-ordered dispatch queue.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Idempotent on the `(shard_id, next_fire_at, job_id)` primary key.
    async fn insert(&self, row: QueueRow) -> Result<()>;

    /// Rows of `shard_id` with `next_fire_at <= now`, ascending by
    /// `(next_fire_at, job_id)`.
    async fn due(&self, shard_id: u32, now: DateTime<Utc>) -> Result<Vec<QueueRow>>;

    async fn delete(&self, row: &QueueRow) -> Result<()>;

    async fn contains(&self, row: &QueueRow) -> Result<bool>;

    /// Rows across all shards with `next_fire_at` before `cutoff`, for the
    /// reconciliation sweep.
    async fn rows_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueueRow>>;
}

/// Addressable bulk storage for offloaded payloads, keyed under `payloads/`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}
