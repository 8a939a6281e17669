//! Reconciliation sweep: restores the cross-store invariants that partial
//! failures break. PENDING jobs must have their queue row; stale rows whose
//! jobs are terminal or gone must not linger.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::Result;
use crate::metrics;
use crate::store::{DispatchQueue, JobStore};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reinserted: usize,
    pub deleted: usize,
}

pub struct ReconciliationSweep {
    job_store: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
    /// Rows older than this with a terminal or missing job are removed.
    stale_after: Duration,
    /// A PENDING job is only repaired once its last write is this old, so
    /// an in-flight dispatch (row deleted, worker still executing) is not
    /// mistaken for a lost row.
    repair_grace: Duration,
}

impl ReconciliationSweep {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
        stale_after: Duration,
        repair_grace: Duration,
    ) -> Self {
        Self {
            job_store,
            queue,
            stale_after,
            repair_grace,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let repair_cutoff = now
            - chrono::Duration::from_std(self.repair_grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        for job in self.job_store.pending_jobs().await? {
            if job.updated_at > repair_cutoff {
                continue;
            }
            let row = job.queue_row();
            match self.queue.contains(&row).await {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(e) = self.queue.insert(row).await {
                        tracing::error!(job_id = %job.job_id, error = %e, "Sweep re-insert failed");
                        continue;
                    }
                    metrics::SWEEP_REPAIRS_TOTAL
                        .with_label_values(&["reinserted"])
                        .inc();
                    tracing::info!(
                        job_id = %job.job_id,
                        shard_id = job.shard_id,
                        "Sweep restored missing queue row"
                    );
                    report.reinserted += 1;
                }
                Err(e) => {
                    tracing::error!(job_id = %job.job_id, error = %e, "Sweep queue lookup failed");
                }
            }
        }

        let stale_cutoff = now
            - chrono::Duration::from_std(self.stale_after)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        for row in self.queue.rows_older_than(stale_cutoff).await? {
            let orphaned = match self.job_store.get_job(row.job_id).await {
                Ok(Some(job)) => job.status.is_terminal(),
                Ok(None) => true,
                Err(e) => {
                    tracing::error!(job_id = %row.job_id, error = %e, "Sweep job lookup failed");
                    false
                }
            };
            if !orphaned {
                continue;
            }
            if let Err(e) = self.queue.delete(&row).await {
                tracing::error!(job_id = %row.job_id, error = %e, "Sweep orphan delete failed");
                continue;
            }
            metrics::SWEEP_REPAIRS_TOTAL
                .with_label_values(&["deleted"])
                .inc();
            tracing::info!(job_id = %row.job_id, "Sweep removed orphan queue row");
            report.deleted += 1;
        }

        Ok(report)
    }
}
