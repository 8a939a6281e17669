//! Embedded engines backing the store traits. Each keeps the same keying
//! discipline as the persisted schema so invariants exercised in tests carry
//! over to a real deployment.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::model::job::DispatchFields;
use crate::model::{Job, JobStatus, QueueRow, RunRecord};
use crate::store::{BlobStore, DispatchQueue, JobStore, UserJobEntry};

#[derive(Default)]
struct JobStoreInner {
    jobs: HashMap<Uuid, Job>,
    // (job_id, run_id) primary key; BTreeMap keeps run listings stable.
    runs: BTreeMap<(Uuid, Uuid), RunRecord>,
    // user partition -> rows clustered by (created_at, job_id)
    user_jobs: HashMap<String, BTreeMap<(DateTime<Utc>, Uuid), UserJobEntry>>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<JobStoreInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job_count(&self) -> usize {
        self.inner.read().await.jobs.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.inner.write().await.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&job_id).cloned())
    }

    async fn dispatch_fields(&self, job_id: Uuid) -> Result<Option<DispatchFields>> {
        Ok(self.inner.read().await.jobs.get(&job_id).map(|job| DispatchFields {
            payload: job.payload.clone(),
            project_id: job.project_id.clone(),
            cron_schedule: job.cron_schedule.clone(),
            user_id: job.user_id.clone(),
            max_retries: job.max_retries,
        }))
    }

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn apply_reschedule(
        &self,
        job_id: Uuid,
        next_fire_at: DateTime<Utc>,
        shard_id: u32,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        job.next_fire_at = next_fire_at;
        job.shard_id = shard_id;
        job.status = JobStatus::Pending;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn pending_jobs(&self) -> Result<Vec<Job>> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect())
    }

    async fn record_run(&self, run: &RunRecord) -> Result<()> {
        self.inner
            .write()
            .await
            .runs
            .insert((run.job_id, run.run_id), run.clone());
        Ok(())
    }

    async fn runs_for_job(&self, job_id: Uuid) -> Result<Vec<RunRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .range((job_id, Uuid::nil())..=(job_id, Uuid::max()))
            .map(|(_, run)| run.clone())
            .collect())
    }

    async fn upsert_user_job(&self, entry: &UserJobEntry) -> Result<()> {
        self.inner
            .write()
            .await
            .user_jobs
            .entry(entry.user_id.clone())
            .or_default()
            .insert((entry.created_at, entry.job_id), entry.clone());
        Ok(())
    }

    async fn user_jobs(&self, user_id: &str) -> Result<Vec<UserJobEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .user_jobs
            .get(user_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_user_job(
        &self,
        user_id: &str,
        job_id: Uuid,
        status: JobStatus,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let rows = inner
            .user_jobs
            .get_mut(user_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        // Recover the clustering created_at from (user_id, job_id).
        let key = rows
            .iter()
            .find(|(_, e)| e.job_id == job_id)
            .map(|(k, _)| *k)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if let Some(entry) = rows.get_mut(&key) {
            entry.status = status;
            if let Some(fire_at) = next_fire_at {
                entry.next_fire_at = fire_at;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDispatchQueue {
    // shard partition -> rows clustered by (next_fire_at, job_id)
    shards: RwLock<HashMap<u32, BTreeSet<(DateTime<Utc>, Uuid)>>>,
}

impl MemoryDispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.shards.read().await.values().map(|s| s.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DispatchQueue for MemoryDispatchQueue {
    async fn insert(&self, row: QueueRow) -> Result<()> {
        self.shards
            .write()
            .await
            .entry(row.shard_id)
            .or_default()
            .insert((row.next_fire_at, row.job_id));
        Ok(())
    }

    async fn due(&self, shard_id: u32, now: DateTime<Utc>) -> Result<Vec<QueueRow>> {
        Ok(self
            .shards
            .read()
            .await
            .get(&shard_id)
            .map(|rows| {
                rows.iter()
                    .take_while(|(fire_at, _)| *fire_at <= now)
                    .map(|(fire_at, job_id)| QueueRow {
                        shard_id,
                        next_fire_at: *fire_at,
                        job_id: *job_id,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, row: &QueueRow) -> Result<()> {
        if let Some(rows) = self.shards.write().await.get_mut(&row.shard_id) {
            rows.remove(&(row.next_fire_at, row.job_id));
        }
        Ok(())
    }

    async fn contains(&self, row: &QueueRow) -> Result<bool> {
        Ok(self
            .shards
            .read()
            .await
            .get(&row.shard_id)
            .map(|rows| rows.contains(&(row.next_fire_at, row.job_id)))
            .unwrap_or(false))
    }

    async fn rows_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueueRow>> {
        Ok(self
            .shards
            .read()
            .await
            .iter()
            .flat_map(|(shard_id, rows)| {
                rows.iter()
                    .take_while(move |(fire_at, _)| *fire_at < cutoff)
                    .map(move |(fire_at, job_id)| QueueRow {
                        shard_id: *shard_id,
                        next_fire_at: *fire_at,
                        job_id: *job_id,
                    })
            })
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().await.get(key).cloned())
    }
}
