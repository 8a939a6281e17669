//! Queue writer: consumes submission events from the write-bus and
//! materialises dispatch-queue rows, decoupling client latency from
//! queue-insert durability.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bus::{BusRecord, WriteBus};
use crate::error::Result;
use crate::metrics;
use crate::model::{QueueRow, SubmissionEvent};
use crate::store::DispatchQueue;

const CONSUMER_GROUP: &str = "queue-writer";
const POLL_WAIT: Duration = Duration::from_millis(100);

pub struct QueueWriter {
    write_bus: Arc<dyn WriteBus>,
    queue: Arc<dyn DispatchQueue>,
}

impl QueueWriter {
    pub fn new(write_bus: Arc<dyn WriteBus>, queue: Arc<dyn DispatchQueue>) -> Self {
        Self { write_bus, queue }
    }

    /// Consume until cancelled. Offsets are committed only after the row
    /// insert succeeded; on insert failure the consumer rejoins from its
    /// committed offsets so the record is redelivered.
    pub async fn run(self, cancel: CancellationToken) {
        let mut consumer = match self.write_bus.subscribe(CONSUMER_GROUP).await {
            Ok(consumer) => consumer,
            Err(e) => {
                tracing::error!(error = %e, "Queue writer failed to join the write bus");
                return;
            }
        };

        tracing::info!("Queue writer consuming");

        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => break,
                record = consumer.poll(POLL_WAIT) => record,
            };

            let record = match record {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Write-bus poll failed");
                    continue;
                }
            };

            match self.apply(&record).await {
                Ok(()) => {
                    if let Err(e) = consumer.commit(&record).await {
                        tracing::error!(error = %e, "Offset commit failed");
                    }
                }
                Err(e) => {
                    tracing::error!(key = %record.key, error = %e, "Queue insert failed, rejoining for redelivery");
                    match self.write_bus.subscribe(CONSUMER_GROUP).await {
                        Ok(c) => consumer = c,
                        Err(e) => {
                            tracing::error!(error = %e, "Rejoin failed, stopping queue writer");
                            return;
                        }
                    }
                }
            }
        }

        tracing::info!("Queue writer stopped");
    }

    async fn apply(&self, record: &BusRecord) -> Result<()> {
        let event: SubmissionEvent = match serde_json::from_slice(&record.payload) {
            Ok(event) => event,
            Err(e) => {
                // Malformed submissions cannot be materialised; skip rather
                // than wedge the partition.
                tracing::error!(key = %record.key, error = %e, "Dropping malformed submission event");
                return Ok(());
            }
        };

        self.queue
            .insert(QueueRow {
                shard_id: event.shard_id,
                next_fire_at: event.next_fire_at,
                job_id: event.job_id,
            })
            .await?;

        metrics::QUEUE_ROWS_WRITTEN_TOTAL.inc();
        tracing::debug!(
            job_id = %event.job_id,
            shard_id = event.shard_id,
            next_fire_at = %event.next_fire_at,
            "Queue row written"
        );
        Ok(())
    }
}
