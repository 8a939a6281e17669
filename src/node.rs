//! Wires the embedded engines and every pipeline stage into one process:
//! ingress, queue writer, pickers, workers, coordinator, metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bus::{MemoryExecutionBus, MemoryWriteBus};
use crate::config::SchedulerConfig;
use crate::coordinator::{Coordinator, ReconciliationSweep};
use crate::ingress::{self, IngressState};
use crate::metrics;
use crate::picker::Picker;
use crate::registry::MemoryOwnershipRegistry;
use crate::store::{MemoryBlobStore, MemoryDispatchQueue, MemoryJobStore};
use crate::worker::Worker;
use crate::writer::QueueWriter;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub http_addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
    pub pickers: usize,
    pub workers: usize,
}

/// One process hosting the whole pipeline over the embedded engines.
pub struct Node {
    pub name: String,
    pub config: SchedulerConfig,
    pub job_store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryDispatchQueue>,
    pub blob_store: Arc<MemoryBlobStore>,
    pub write_bus: Arc<MemoryWriteBus>,
    pub execution_bus: Arc<MemoryExecutionBus>,
    pub registry: Arc<MemoryOwnershipRegistry>,
}

impl Node {
    /// Must be called from within a tokio runtime.
    pub fn new(name: String, config: SchedulerConfig) -> Self {
        let execution_bus = Arc::new(MemoryExecutionBus::new(config.visibility_timeout));
        Self {
            name,
            config,
            job_store: Arc::new(MemoryJobStore::new()),
            queue: Arc::new(MemoryDispatchQueue::new()),
            blob_store: Arc::new(MemoryBlobStore::new()),
            write_bus: Arc::new(MemoryWriteBus::default()),
            execution_bus,
            registry: Arc::new(MemoryOwnershipRegistry::new()),
        }
    }

    pub fn ingress_state(&self) -> IngressState {
        IngressState {
            job_store: self.job_store.clone(),
            blob_store: self.blob_store.clone(),
            write_bus: self.write_bus.clone(),
            config: self.config.clone(),
        }
    }

    pub fn queue_writer(&self) -> QueueWriter {
        QueueWriter::new(self.write_bus.clone(), self.queue.clone())
    }

    pub fn picker(&self, id: String) -> Picker {
        Picker::new(
            id,
            self.registry.clone(),
            self.queue.clone(),
            self.job_store.clone(),
            self.execution_bus.clone(),
            self.config.clone(),
        )
    }

    pub fn worker(&self, id: String) -> Worker {
        Worker::new(
            id,
            self.execution_bus.clone(),
            self.job_store.clone(),
            self.blob_store.clone(),
            self.queue.clone(),
            self.config.clone(),
        )
    }

    pub fn coordinator(&self, id: String) -> Coordinator {
        let sweep = ReconciliationSweep::new(
            self.job_store.clone(),
            self.queue.clone(),
            self.config.stale_after,
            self.config.visibility_timeout,
        );
        Coordinator::new(id, self.registry.clone(), self.config.clone(), Some(sweep))
    }

    /// Run every stage until the token is cancelled. Blocks on the ingress
    /// server; all other stages run as spawned tasks.
    pub async fn run(self, opts: RunOptions, cancel: CancellationToken) {
        tracing::info!(
            node = %self.name,
            http_addr = %opts.http_addr,
            metrics_addr = ?opts.metrics_addr,
            pickers = opts.pickers,
            workers = opts.workers,
            shard_count = self.config.shard_count,
            "Starting node"
        );

        if let Some(metrics_addr) = opts.metrics_addr {
            tokio::spawn(metrics::serve_metrics(metrics_addr, cancel.clone()));
        }

        let writer = self.queue_writer();
        tokio::spawn(writer.run(cancel.clone()));

        for i in 0..opts.pickers {
            let picker = self.picker(format!("{}-picker-{i}", self.name));
            tokio::spawn(picker.run(cancel.clone()));
        }

        for i in 0..opts.workers {
            let worker = self.worker(format!("{}-worker-{i}", self.name));
            tokio::spawn(worker.run(cancel.clone()));
        }

        let coordinator = self.coordinator(format!("{}-coordinator", self.name));
        tokio::spawn(coordinator.run(cancel.clone()));

        ingress::serve(opts.http_addr, self.ingress_state(), cancel).await;
    }
}
