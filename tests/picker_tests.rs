mod test_harness;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use chime::bus::{ExecutionBus, ReceivedMessage};
use chime::config::SchedulerConfig;
use chime::error::{Result, SchedulerError};
use chime::model::{DispatchEvent, QueueRow, RunStatus};
use chime::picker::Picker;
use chime::store::{DispatchQueue, JobStore};
use test_harness::{assert_eventually, TestCluster};

const SHORT: Duration = Duration::from_millis(100);

async fn receive_events(cluster: &TestCluster, max: usize) -> Vec<DispatchEvent> {
    cluster
        .node
        .execution_bus
        .receive(max, SHORT)
        .await
        .unwrap()
        .into_iter()
        .map(|m| serde_json::from_str(&m.body).unwrap())
        .collect()
}

#[tokio::test]
async fn test_due_row_dispatched_and_deleted() {
    let cluster = TestCluster::start(0, 0).await;
    let job_id = cluster.submit("test", "", "").await;
    let job = cluster.node.job_store.get_job(job_id).await.unwrap().unwrap();

    // Wait for the queue writer to materialise the row, then scan directly.
    assert_eventually(
        || async { cluster.node.queue.contains(&job.queue_row()).await.unwrap() },
        Duration::from_secs(2),
        "queue row materialised",
    )
    .await;

    let picker = cluster.node.picker("p0".to_string());
    picker.scan_shard(job.shard_id).await;

    let events = receive_events(&cluster, 10).await;
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.job_id, job_id);
    assert_eq!(event.status, RunStatus::Started);
    assert_eq!(event.payload, "test");
    assert_eq!(event.user_id, test_harness::TEST_USER);
    assert!(event.executed_at >= job.next_fire_at);

    // Publish success implies the row is gone.
    assert!(!cluster.node.queue.contains(&job.queue_row()).await.unwrap());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_future_row_not_dispatched() {
    let cluster = TestCluster::start(0, 0).await;
    let fire_at = (Utc::now() + chrono::Duration::seconds(30)).to_rfc3339();
    let job_id = cluster.submit("test", "", &fire_at).await;
    let job = cluster.node.job_store.get_job(job_id).await.unwrap().unwrap();

    assert_eventually(
        || async { cluster.node.queue.contains(&job.queue_row()).await.unwrap() },
        Duration::from_secs(2),
        "queue row materialised",
    )
    .await;

    let picker = cluster.node.picker("p0".to_string());
    picker.scan_shard(job.shard_id).await;

    assert!(receive_events(&cluster, 10).await.is_empty());
    assert!(cluster.node.queue.contains(&job.queue_row()).await.unwrap());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_order_follows_fire_time() {
    let cluster = TestCluster::start(0, 0).await;
    let now = Utc::now();

    // Rows planted directly into one shard, out of order.
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    for (job_id, offset) in [(second, 2i64), (first, 5)] {
        let mut job = {
            let job_id_submitted = cluster.submit("test", "", "").await;
            cluster
                .node
                .job_store
                .get_job(job_id_submitted)
                .await
                .unwrap()
                .unwrap()
        };
        job.job_id = job_id;
        job.shard_id = 3;
        job.next_fire_at = now - chrono::Duration::seconds(offset);
        cluster.node.job_store.insert_job(&job).await.unwrap();
        cluster.node.queue.insert(job.queue_row()).await.unwrap();
    }

    let picker = cluster.node.picker("p0".to_string());
    picker.scan_shard(3).await;

    let events = receive_events(&cluster, 10).await;
    let ours: Vec<Uuid> = events
        .iter()
        .map(|e| e.job_id)
        .filter(|id| *id == first || *id == second)
        .collect();
    assert_eq!(ours, vec![first, second]);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_missing_job_record_leaves_row() {
    let cluster = TestCluster::start(0, 0).await;
    let row = QueueRow {
        shard_id: 5,
        next_fire_at: Utc::now() - chrono::Duration::seconds(1),
        job_id: Uuid::new_v4(),
    };
    cluster.node.queue.insert(row).await.unwrap();

    let picker = cluster.node.picker("p0".to_string());
    picker.scan_shard(5).await;

    // Enrichment failed; nothing published, row kept for the next cycle.
    assert!(receive_events(&cluster, 10).await.is_empty());
    assert!(cluster.node.queue.contains(&row).await.unwrap());

    cluster.shutdown().await;
}

/// Execution bus double that fails the first `failures` publishes.
struct FlakyExecutionBus {
    inner: Arc<chime::bus::MemoryExecutionBus>,
    failures: AtomicUsize,
}

#[async_trait]
impl ExecutionBus for FlakyExecutionBus {
    async fn send(&self, body: String) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SchedulerError::Bus("injected publish failure".to_string()));
        }
        self.inner.send(body).await
    }

    async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<ReceivedMessage>> {
        self.inner.receive(max_messages, wait).await
    }

    async fn delete(&self, receipt_handle: Uuid) -> Result<()> {
        self.inner.delete(receipt_handle).await
    }
}

#[tokio::test]
async fn test_publish_failure_keeps_row_for_retry() {
    let cluster = TestCluster::start(0, 0).await;
    let job_id = cluster.submit("test", "", "").await;
    let job = cluster.node.job_store.get_job(job_id).await.unwrap().unwrap();

    assert_eventually(
        || async { cluster.node.queue.contains(&job.queue_row()).await.unwrap() },
        Duration::from_secs(2),
        "queue row materialised",
    )
    .await;

    let flaky = Arc::new(FlakyExecutionBus {
        inner: cluster.node.execution_bus.clone(),
        failures: AtomicUsize::new(1),
    });
    let picker = Picker::new(
        "p0".to_string(),
        cluster.node.registry.clone(),
        cluster.node.queue.clone(),
        cluster.node.job_store.clone(),
        flaky,
        SchedulerConfig::for_tests(),
    );

    // First cycle: publish fails, the row must survive.
    picker.scan_shard(job.shard_id).await;
    assert!(cluster.node.queue.contains(&job.queue_row()).await.unwrap());
    assert_eq!(cluster.node.execution_bus.depth().await, 0);

    // Next cycle retries the same row and succeeds.
    picker.scan_shard(job.shard_id).await;
    assert!(!cluster.node.queue.contains(&job.queue_row()).await.unwrap());
    assert_eq!(cluster.node.execution_bus.depth().await, 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_each_dispatch_gets_fresh_run_id() {
    let cluster = TestCluster::start(0, 0).await;
    let job_id = cluster.submit("test", "", "").await;
    let job = cluster.node.job_store.get_job(job_id).await.unwrap().unwrap();

    // Duplicate dispatch of the same row (e.g. two owners during a handoff
    // window) must produce distinct run ids.
    let picker = cluster.node.picker("p0".to_string());
    assert_eventually(
        || async { cluster.node.queue.contains(&job.queue_row()).await.unwrap() },
        Duration::from_secs(2),
        "queue row materialised",
    )
    .await;
    picker.scan_shard(job.shard_id).await;
    cluster.node.queue.insert(job.queue_row()).await.unwrap();
    picker.scan_shard(job.shard_id).await;

    let events = receive_events(&cluster, 10).await;
    assert_eq!(events.len(), 2);
    assert_ne!(events[0].run_id, events[1].run_id);
    assert_eq!(events[0].job_id, events[1].job_id);

    cluster.shutdown().await;
}
