//! Test harness for pipeline integration tests.
//!
//! Spins up the embedded engines plus any subset of service loops with
//! scaled-down periods, and drives the HTTP surface through the real router.

use std::future::Future;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

use chime::config::SchedulerConfig;
use chime::ingress;
use chime::node::Node;

pub const TEST_USER: &str = "test-user";

/// Handle to a running in-process cluster.
pub struct TestCluster {
    pub node: Node,
    pub cancel: CancellationToken,
    pub picker_handles: Vec<JoinHandle<()>>,
    pub worker_handles: Vec<JoinHandle<()>>,
    pub coordinator_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,
}

impl TestCluster {
    /// Start a cluster with the given number of picker and worker loops,
    /// plus the queue writer and one coordinator.
    pub async fn start(pickers: usize, workers: usize) -> Self {
        Self::start_with_config(pickers, workers, SchedulerConfig::for_tests()).await
    }

    pub async fn start_with_config(
        pickers: usize,
        workers: usize,
        config: SchedulerConfig,
    ) -> Self {
        let node = Node::new("test".to_string(), config);
        let cancel = CancellationToken::new();

        let writer_handle = Some(tokio::spawn(node.queue_writer().run(cancel.clone())));

        let mut cluster = Self {
            node,
            cancel,
            picker_handles: Vec::new(),
            worker_handles: Vec::new(),
            coordinator_handle: None,
            writer_handle,
        };

        for i in 0..pickers {
            cluster.spawn_picker(&format!("picker-{i}"));
        }
        for i in 0..workers {
            cluster.spawn_worker(&format!("worker-{i}"));
        }
        cluster.spawn_coordinator("coordinator-0");
        cluster
    }

    pub fn spawn_picker(&mut self, id: &str) {
        let picker = self.node.picker(id.to_string());
        self.picker_handles
            .push(tokio::spawn(picker.run(self.cancel.clone())));
    }

    pub fn spawn_worker(&mut self, id: &str) {
        let worker = self.node.worker(id.to_string());
        self.worker_handles
            .push(tokio::spawn(worker.run(self.cancel.clone())));
    }

    pub fn spawn_coordinator(&mut self, id: &str) {
        let coordinator = self.node.coordinator(id.to_string());
        self.coordinator_handle = Some(tokio::spawn(coordinator.run(self.cancel.clone())));
    }

    /// Abort all picker tasks, simulating picker crashes. Presence leases
    /// expire on their own.
    pub fn kill_pickers(&mut self) {
        for handle in self.picker_handles.drain(..) {
            handle.abort();
        }
    }

    /// Abort all worker tasks mid-flight, simulating worker crashes.
    pub fn kill_workers(&mut self) {
        for handle in self.worker_handles.drain(..) {
            handle.abort();
        }
    }

    pub fn app(&self) -> Router {
        ingress::router(self.node.ingress_state())
    }

    /// POST /submit through the real router.
    pub async fn submit_raw(&self, body: Value, user_id: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/submit")
            .header("content-type", "application/json")
            .header("X-User-ID", user_id)
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = self.app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// Submit and return the assigned job id; panics on rejection.
    pub async fn submit(&self, payload: &str, cron_schedule: &str, next_fire_at: &str) -> Uuid {
        let (status, body) = self
            .submit_raw(
                json!({
                    "project_id": "integration-test",
                    "payload": payload,
                    "cron_schedule": cron_schedule,
                    "next_fire_at": next_fire_at,
                    "max_retries": 0,
                }),
                TEST_USER,
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "submission rejected: {body}");
        Uuid::parse_str(body["job_id"].as_str().unwrap()).unwrap()
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.writer_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
