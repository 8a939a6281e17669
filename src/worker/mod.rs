//! Worker: long-polls the execution bus, resolves offloaded payloads, runs
//! them, records run outcomes, drives job lifecycle (terminal status or
//! reschedule), and acknowledges last.
//!
//! Acknowledgement order is the at-least-once backbone: any failure before
//! the delete leaves the message to reappear after the visibility timeout,
//! where a new attempt gets a fresh `run_id`.

pub mod executor;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::bus::{ExecutionBus, ReceivedMessage};
use crate::config::SchedulerConfig;
use crate::metrics;
use crate::model::job::BLOB_REF_PREFIX;
use crate::model::{DispatchEvent, JobStatus, QueueRow, RunRecord, RunStatus};
use crate::schedule::Recurrence;
use crate::store::{BlobStore, DispatchQueue, JobStore};

pub use executor::{PayloadOutcome, PayloadRunner};

const RECEIVE_BATCH: usize = 10;

pub struct Worker {
    pub id: String,
    execution_bus: Arc<dyn ExecutionBus>,
    job_store: Arc<dyn JobStore>,
    blob_store: Arc<dyn BlobStore>,
    queue: Arc<dyn DispatchQueue>,
    runner: PayloadRunner,
    config: SchedulerConfig,
}

impl Worker {
    pub fn new(
        id: String,
        execution_bus: Arc<dyn ExecutionBus>,
        job_store: Arc<dyn JobStore>,
        blob_store: Arc<dyn BlobStore>,
        queue: Arc<dyn DispatchQueue>,
        config: SchedulerConfig,
    ) -> Self {
        let runner = PayloadRunner::new(config.output_limit);
        Self {
            id,
            execution_bus,
            job_store,
            blob_store,
            queue,
            runner,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(worker_id = %self.id, "Worker polling");

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.execution_bus.receive(RECEIVE_BATCH, self.config.poll_wait) => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Receive failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            for message in batch {
                if cancel.is_cancelled() {
                    // Unacknowledged messages reappear after the visibility
                    // timeout.
                    break;
                }
                self.process_message(message).await;
            }
        }

        tracing::info!(worker_id = %self.id, "Worker stopped");
    }

    pub async fn process_message(&self, message: ReceivedMessage) {
        let event: DispatchEvent = match serde_json::from_str(&message.body) {
            Ok(event) => event,
            Err(e) => {
                // Left in place for the bus's own poison-pill policy.
                tracing::error!(worker_id = %self.id, error = %e, "Malformed dispatch event left for redelivery");
                return;
            }
        };

        let start = Instant::now();

        let payload = match self.resolve_payload(&event).await {
            Ok(payload) => payload,
            Err(error_message) => {
                // Payload-fetch failure is observable and deterministic:
                // record the failed run and acknowledge.
                metrics::JOBS_EXECUTED_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                let run = self.compose_run(&event, RunStatus::Failed, String::new(), error_message);
                if self.job_store.record_run(&run).await.is_ok()
                    && self.finish_lifecycle(&event, RunStatus::Failed).await
                {
                    self.acknowledge(&message).await;
                }
                return;
            }
        };

        tracing::info!(
            worker_id = %self.id,
            job_id = %event.job_id,
            run_id = %event.run_id,
            "Executing job"
        );

        let outcome = self.runner.run(event.job_id, &payload).await;
        metrics::JOB_EXECUTION_DURATION.observe(start.elapsed().as_secs_f64());
        metrics::JOBS_EXECUTED_TOTAL
            .with_label_values(&[match outcome.status {
                RunStatus::Completed => "success",
                _ => "failed",
            }])
            .inc();

        let run = self.compose_run(&event, outcome.status, outcome.output, outcome.error_message);
        if let Err(e) = self.job_store.record_run(&run).await {
            // No acknowledgement: the visibility timeout redelivers and a
            // fresh run_id records the retry.
            tracing::error!(run_id = %event.run_id, error = %e, "Run record write failed, leaving message for redelivery");
            return;
        }

        tracing::info!(job_id = %event.job_id, status = %run.status, "Job completed");

        if !self.finish_lifecycle(&event, run.status).await {
            return;
        }

        self.acknowledge(&message).await;
    }

    async fn resolve_payload(&self, event: &DispatchEvent) -> Result<String, String> {
        let Some(key) = event.payload.strip_prefix(BLOB_REF_PREFIX) else {
            return Ok(event.payload.clone());
        };
        metrics::BLOB_OPERATIONS_TOTAL
            .with_label_values(&["download"])
            .inc();
        match self.blob_store.get(key).await {
            Ok(Some(bytes)) => Ok(String::from_utf8_lossy(&bytes).to_string()),
            Ok(None) => {
                tracing::error!(job_id = %event.job_id, key, "Payload blob missing");
                Err(format!("payload blob missing: {key}"))
            }
            Err(e) => {
                tracing::error!(job_id = %event.job_id, key, error = %e, "Payload fetch failed");
                Err(format!("payload fetch failed: {e}"))
            }
        }
    }

    fn compose_run(
        &self,
        event: &DispatchEvent,
        status: RunStatus,
        output: String,
        error_message: String,
    ) -> RunRecord {
        RunRecord {
            job_id: event.job_id,
            run_id: event.run_id,
            user_id: event.user_id.clone(),
            status,
            triggered_at: event.executed_at,
            completed_at: Utc::now(),
            output,
            worker_id: self.id.clone(),
            error_message,
        }
    }

    /// Advance the job past this run: roll recurring jobs forward, finalise
    /// one-shot jobs. Returns false when the message must be left
    /// unacknowledged for redelivery.
    async fn finish_lifecycle(&self, event: &DispatchEvent, run_status: RunStatus) -> bool {
        if event.cron_schedule.is_empty() {
            let job_status = match run_status {
                RunStatus::Completed => JobStatus::Completed,
                _ => JobStatus::Failed,
            };
            return self.finalize_job(event, job_status).await;
        }
        self.reschedule(event).await
    }

    async fn finalize_job(&self, event: &DispatchEvent, status: JobStatus) -> bool {
        if let Err(e) = self.job_store.update_status(event.job_id, status).await {
            tracing::error!(job_id = %event.job_id, error = %e, "Terminal status update failed, leaving message for redelivery");
            return false;
        }
        // Projection update; divergence is repaired by later writes.
        if let Err(e) = self
            .job_store
            .update_user_job(&event.user_id, event.job_id, status, None)
            .await
        {
            tracing::warn!(job_id = %event.job_id, error = %e, "User index update failed (non-fatal)");
        }
        true
    }

    async fn reschedule(&self, event: &DispatchEvent) -> bool {
        let recurrence = match Recurrence::parse(&event.cron_schedule) {
            Ok(recurrence) => recurrence,
            Err(e) => {
                tracing::error!(job_id = %event.job_id, error = %e, "Unparsable schedule, finalising job");
                return self.finalize_job(event, JobStatus::Failed).await;
            }
        };
        let next_fire_at = match recurrence.next_after(Utc::now()) {
            Some(next_fire_at) => next_fire_at,
            None => {
                tracing::warn!(job_id = %event.job_id, "Schedule has no future occurrence, finalising job");
                return self.finalize_job(event, JobStatus::Completed).await;
            }
        };

        // Reshuffling the shard on every cycle spreads load over time; any
        // uniform choice is valid.
        let shard_id = rand::thread_rng().gen_range(0..self.config.shard_count);

        tracing::info!(
            job_id = %event.job_id,
            next_fire_at = %next_fire_at,
            shard_id,
            "Rescheduling job"
        );

        if let Err(e) = self
            .job_store
            .apply_reschedule(event.job_id, next_fire_at, shard_id)
            .await
        {
            tracing::error!(job_id = %event.job_id, error = %e, "Reschedule write failed, leaving message for redelivery");
            return false;
        }

        // Canonical state is updated; if this insert fails the sweep
        // restores the queue row.
        if let Err(e) = self
            .queue
            .insert(QueueRow {
                shard_id,
                next_fire_at,
                job_id: event.job_id,
            })
            .await
        {
            tracing::error!(job_id = %event.job_id, error = %e, "Queue re-insert failed, sweep will restore");
        }

        if let Err(e) = self
            .job_store
            .update_user_job(
                &event.user_id,
                event.job_id,
                JobStatus::Pending,
                Some(next_fire_at),
            )
            .await
        {
            tracing::warn!(job_id = %event.job_id, error = %e, "User index update failed (non-fatal)");
        }

        true
    }

    async fn acknowledge(&self, message: &ReceivedMessage) {
        if let Err(e) = self.execution_bus.delete(message.receipt_handle).await {
            tracing::error!(
                worker_id = %self.id,
                message_id = %message.message_id,
                error = %e,
                "Acknowledgement failed; message will be redelivered"
            );
        }
    }
}
