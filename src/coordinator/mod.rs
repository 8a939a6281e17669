//! Coordinator: leader-elected controller that partitions the shard space
//! across live pickers and hosts the reconciliation sweep.
//!
//! Exactly one coordinator holds `/scheduler/leader` at any instant. Loss of
//! the lease session ends the run so a peer (or a restarted process) can win
//! the next election.

pub mod assignment;
pub mod sweep;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::metrics;
use crate::registry::{
    LeaseId, OwnershipRegistry, ASSIGNMENTS_PREFIX, LEADER_KEY, PICKERS_PREFIX,
};

pub use assignment::{decode_assignment, encode_assignment, rebalance, ShardRange};
pub use sweep::{ReconciliationSweep, SweepReport};

pub struct Coordinator {
    pub id: String,
    registry: Arc<dyn OwnershipRegistry>,
    config: SchedulerConfig,
    sweep: Option<ReconciliationSweep>,
}

impl Coordinator {
    pub fn new(
        id: String,
        registry: Arc<dyn OwnershipRegistry>,
        config: SchedulerConfig,
        sweep: Option<ReconciliationSweep>,
    ) -> Self {
        Self {
            id,
            registry,
            config,
            sweep,
        }
    }

    /// Campaign for leadership, then reconcile until the lease session is
    /// lost or the token is cancelled. Session loss ends the run; the
    /// process is expected to restart clean.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(coordinator_id = %self.id, "Campaigning for leadership");

        let lease = match self.campaign(&cancel).await {
            Some(lease) => lease,
            None => return,
        };

        tracing::info!(coordinator_id = %self.id, "Elected as leader");
        self.lead(&cancel, lease).await;

        let _ = self.registry.revoke_lease(lease).await;
        tracing::info!(coordinator_id = %self.id, "Coordinator stopped");
    }

    /// Block until this coordinator holds the leader key.
    async fn campaign(&self, cancel: &CancellationToken) -> Option<LeaseId> {
        let retry = self.config.lease_ttl / 2;
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let lease = match self.registry.grant_lease(self.config.lease_ttl).await {
                Ok(lease) => lease,
                Err(e) => {
                    tracing::error!(error = %e, "Lease grant failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(retry) => continue,
                    }
                }
            };

            loop {
                match self.registry.try_acquire(LEADER_KEY, &self.id, lease).await {
                    Ok(true) => return Some(lease),
                    Ok(false) => {}
                    Err(e) => {
                        // Candidacy lease expired; start over with a new one.
                        tracing::warn!(error = %e, "Candidacy lease lost, re-granting");
                        break;
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = self.registry.revoke_lease(lease).await;
                        return None;
                    }
                    _ = tokio::time::sleep(retry) => {}
                }
                if let Err(e) = self.registry.keep_alive(lease).await {
                    tracing::warn!(error = %e, "Candidacy lease lost, re-granting");
                    break;
                }
            }
        }
    }

    async fn lead(&self, cancel: &CancellationToken, lease: LeaseId) {
        let mut previous = self.load_assignments().await;

        let mut keepalive = tokio::time::interval(self.config.lease_ttl / 3);
        let mut reconcile = tokio::time::interval(self.config.coordinator_period);
        let mut sweep = tokio::time::interval(self.config.sweep_period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = keepalive.tick() => {
                    if let Err(e) = self.registry.keep_alive(lease).await {
                        tracing::error!(coordinator_id = %self.id, error = %e, "Leader lease lost, stepping down");
                        return;
                    }
                }
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile_once(&mut previous).await {
                        tracing::error!(error = %e, "Reconcile failed");
                    }
                }
                _ = sweep.tick() => {
                    if let Some(sweep) = &self.sweep {
                        if let Err(e) = sweep.run_once().await {
                            tracing::error!(error = %e, "Reconciliation sweep failed");
                        }
                    }
                }
            }
        }
    }

    /// Last assignments written by a previous leader, so stability carries
    /// across elections.
    async fn load_assignments(&self) -> HashMap<String, Vec<ShardRange>> {
        let mut previous = HashMap::new();
        match self.registry.list_prefix(ASSIGNMENTS_PREFIX).await {
            Ok(entries) => {
                for (key, value) in entries {
                    let picker = key.trim_start_matches(ASSIGNMENTS_PREFIX).to_string();
                    match decode_assignment(&value) {
                        Ok(ranges) => {
                            previous.insert(picker, ranges);
                        }
                        Err(e) => {
                            tracing::warn!(key, error = %e, "Ignoring undecodable assignment")
                        }
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Assignment preload failed"),
        }
        previous
    }

    pub async fn reconcile_once(
        &self,
        previous: &mut HashMap<String, Vec<ShardRange>>,
    ) -> Result<()> {
        let live: Vec<String> = self
            .registry
            .list_prefix(PICKERS_PREFIX)
            .await?
            .into_iter()
            .map(|(key, _)| key.trim_start_matches(PICKERS_PREFIX).to_string())
            .collect();

        if live.is_empty() {
            tracing::debug!("No live pickers; leaving assignments untouched");
            return Ok(());
        }

        let next = rebalance(self.config.shard_count, &live, previous);

        for (picker, ranges) in &next {
            if previous.get(picker) == Some(ranges) {
                continue;
            }
            let encoded = encode_assignment(ranges)?;
            self.registry
                .put(&format!("{ASSIGNMENTS_PREFIX}{picker}"), &encoded, None)
                .await?;
            metrics::SHARD_REBALANCES_TOTAL.inc();
            tracing::info!(
                picker,
                shards = ranges.iter().map(ShardRange::len).sum::<u32>(),
                "Assignment written"
            );
        }

        // Clear keys of pickers that disappeared.
        for picker in previous.keys() {
            if !next.contains_key(picker) {
                self.registry
                    .delete(&format!("{ASSIGNMENTS_PREFIX}{picker}"))
                    .await?;
                tracing::info!(picker, "Assignment removed for departed picker");
            }
        }

        *previous = next;
        Ok(())
    }
}
