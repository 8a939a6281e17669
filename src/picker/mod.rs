//! Picker: scans its owned shards of the dispatch queue for due rows,
//! enriches them from the job store, publishes dispatch events to the
//! execution bus, and deletes rows only once the bus accepted the event.
//!
//! Ownership comes from the coordinator through the registry: a TTL-leased
//! presence key announces the picker, and a watch on its assignment key
//! delivers shard ranges. Newly acquired shards are not scanned until a
//! grace delay has passed, so an outgoing owner can finish its cycle;
//! released shards are dropped immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::ExecutionBus;
use crate::config::SchedulerConfig;
use crate::coordinator::assignment::decode_assignment;
use crate::metrics;
use crate::model::{DispatchEvent, QueueRow, RunStatus};
use crate::registry::{LeaseId, OwnershipRegistry, ASSIGNMENTS_PREFIX, PICKERS_PREFIX};
use crate::store::{DispatchQueue, JobStore};

pub struct Picker {
    pub id: String,
    registry: Arc<dyn OwnershipRegistry>,
    queue: Arc<dyn DispatchQueue>,
    job_store: Arc<dyn JobStore>,
    execution_bus: Arc<dyn ExecutionBus>,
    config: SchedulerConfig,
}

impl Picker {
    pub fn new(
        id: String,
        registry: Arc<dyn OwnershipRegistry>,
        queue: Arc<dyn DispatchQueue>,
        job_store: Arc<dyn JobStore>,
        execution_bus: Arc<dyn ExecutionBus>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            id,
            registry,
            queue,
            job_store,
            execution_bus,
            config,
        }
    }

    /// Register presence, adopt assignments, and scan until cancelled or
    /// the presence lease is lost.
    pub async fn run(self, cancel: CancellationToken) {
        let lease = match self.register(cancel.clone()).await {
            Some(lease) => lease,
            None => return,
        };

        let assignment_key = format!("{ASSIGNMENTS_PREFIX}{}", self.id);
        let mut assignment_rx = match self.registry.watch(&assignment_key).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!(picker_id = %self.id, error = %e, "Assignment watch failed");
                return;
            }
        };

        // shard -> instant from which it may be scanned
        let mut owned: HashMap<u32, Instant> = HashMap::new();
        self.adopt(&mut owned, assignment_rx.borrow_and_update().clone());

        let mut scan = tokio::time::interval(self.config.scan_period);
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut keepalive = tokio::time::interval(self.config.lease_ttl / 3);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = keepalive.tick() => {
                    if let Err(e) = self.registry.keep_alive(lease).await {
                        tracing::error!(picker_id = %self.id, error = %e, "Presence lease lost, stopping");
                        break;
                    }
                }
                changed = assignment_rx.changed() => {
                    if changed.is_err() {
                        tracing::error!(picker_id = %self.id, "Assignment watch closed, stopping");
                        break;
                    }
                    self.adopt(&mut owned, assignment_rx.borrow_and_update().clone());
                }
                _ = scan.tick() => {
                    let now = Instant::now();
                    let ready: Vec<u32> = owned
                        .iter()
                        .filter(|(_, active_after)| **active_after <= now)
                        .map(|(shard, _)| *shard)
                        .collect();
                    for shard in ready {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let start = Instant::now();
                        self.scan_shard(shard).await;
                        let label = shard.to_string();
                        metrics::SCAN_CYCLE_DURATION
                            .with_label_values(&[&label])
                            .observe(start.elapsed().as_secs_f64());
                        metrics::PICKER_SCANS_TOTAL
                            .with_label_values(&[&label])
                            .inc();
                    }
                }
            }
        }

        let _ = self.registry.revoke_lease(lease).await;
        tracing::info!(picker_id = %self.id, "Picker stopped");
    }

    async fn register(&self, cancel: CancellationToken) -> Option<LeaseId> {
        loop {
            match self.try_register().await {
                Ok(lease) => {
                    tracing::info!(picker_id = %self.id, "Picker registered");
                    return Some(lease);
                }
                Err(e) => {
                    tracing::error!(picker_id = %self.id, error = %e, "Picker registration failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.config.lease_ttl / 2) => {}
                    }
                }
            }
        }
    }

    async fn try_register(&self) -> crate::error::Result<LeaseId> {
        let lease = self.registry.grant_lease(self.config.lease_ttl).await?;
        self.registry
            .put(&format!("{PICKERS_PREFIX}{}", self.id), &self.id, Some(lease))
            .await?;
        Ok(lease)
    }

    /// Apply a new assignment: releases take effect immediately, acquisitions
    /// after the handoff grace.
    fn adopt(&self, owned: &mut HashMap<u32, Instant>, raw: Option<String>) {
        let ranges = match raw.as_deref() {
            Some(raw) => match decode_assignment(raw) {
                Ok(ranges) => ranges,
                Err(e) => {
                    tracing::error!(picker_id = %self.id, error = %e, "Bad assignment value ignored");
                    return;
                }
            },
            None => Vec::new(),
        };

        let assigned: std::collections::HashSet<u32> =
            ranges.iter().flat_map(|r| r.shards()).collect();

        let before = owned.len();
        owned.retain(|shard, _| assigned.contains(shard));
        let released = before - owned.len();

        let activate_at = Instant::now() + self.config.handoff_grace;
        let mut acquired = 0usize;
        for shard in assigned {
            owned.entry(shard).or_insert_with(|| {
                acquired += 1;
                activate_at
            });
        }

        if released > 0 || acquired > 0 {
            tracing::info!(
                picker_id = %self.id,
                owned = owned.len(),
                acquired,
                released,
                "Assignment adopted"
            );
        }
    }

    /// One scan cycle for one shard: range-scan due rows, enrich, publish,
    /// delete on publish success only.
    pub async fn scan_shard(&self, shard_id: u32) {
        let now = Utc::now();
        let candidates = match self.queue.due(shard_id, now).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!(shard_id, error = %e, "Shard scan failed");
                return;
            }
        };
        metrics::JOBS_SCANNED_TOTAL.inc_by(candidates.len() as u64);

        for candidate in candidates {
            self.dispatch_candidate(candidate).await;
        }
    }

    async fn dispatch_candidate(&self, candidate: QueueRow) {
        // Enrichment read; on failure the row stays for the next cycle.
        let fields = match self.job_store.dispatch_fields(candidate.job_id).await {
            Ok(Some(fields)) => fields,
            Ok(None) => {
                tracing::warn!(job_id = %candidate.job_id, "Candidate has no job record, skipping");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %candidate.job_id, error = %e, "Enrichment read failed, skipping");
                return;
            }
        };

        let event = DispatchEvent {
            job_id: candidate.job_id,
            run_id: Uuid::new_v4(),
            status: RunStatus::Started,
            executed_at: Utc::now(),
            payload: fields.payload,
            project_id: fields.project_id,
            user_id: fields.user_id,
            cron_schedule: fields.cron_schedule,
            max_retries: fields.max_retries,
        };
        let body = match serde_json::to_string(&event) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(job_id = %candidate.job_id, error = %e, "Dispatch event encoding failed");
                return;
            }
        };

        tracing::debug!(job_id = %candidate.job_id, shard_id = candidate.shard_id, "Picking job");

        let publish_start = Instant::now();
        let published = self.execution_bus.send(body).await;
        metrics::DISPATCH_PUBLISH_DURATION.observe(publish_start.elapsed().as_secs_f64());

        if let Err(e) = published {
            metrics::DISPATCH_PUBLISH_ERRORS.inc();
            tracing::error!(job_id = %candidate.job_id, error = %e, "Dispatch publish failed, row kept");
            return;
        }
        metrics::JOBS_DISPATCHED_TOTAL.inc();

        // Delete only after the bus accepted the event; a crash in between
        // means a duplicate dispatch, never a lost one.
        if let Err(e) = self.queue.delete(&candidate).await {
            tracing::error!(job_id = %candidate.job_id, error = %e, "Queue row delete failed");
        }
    }
}
