//! Prometheus metric families, mirroring the observability surface of each
//! pipeline stage, plus the text-exposition listener served on its own port.

use std::net::SocketAddr;

use axum::{routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use tokio_util::sync::CancellationToken;

// Ingress
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("register http_requests_total")
});

pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"]
    )
    .expect("register http_request_duration_seconds")
});

pub static JOBS_CREATED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "jobs_created_total",
        "Total number of jobs created",
        &["user_id"]
    )
    .expect("register jobs_created_total")
});

pub static PAYLOAD_STORAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "payload_storage_duration_seconds",
        "Time taken to store a payload, by storage target",
        &["storage"]
    )
    .expect("register payload_storage_duration_seconds")
});

pub static SUBMIT_PUBLISH_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "submit_publish_duration_seconds",
        "Time taken to publish a submission event to the write bus"
    )
    .expect("register submit_publish_duration_seconds")
});

pub static SUBMIT_PUBLISH_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "submit_publish_errors_total",
        "Total number of write-bus publish errors"
    )
    .expect("register submit_publish_errors_total")
});

// Queue writer
pub static QUEUE_ROWS_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "queue_rows_written_total",
        "Total number of dispatch-queue rows materialised"
    )
    .expect("register queue_rows_written_total")
});

// Picker
pub static PICKER_SCANS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "picker_scans_total",
        "Total number of shard scans",
        &["shard_id"]
    )
    .expect("register picker_scans_total")
});

pub static JOBS_SCANNED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "jobs_scanned_total",
        "Total number of due rows scanned from the dispatch queue"
    )
    .expect("register jobs_scanned_total")
});

pub static JOBS_DISPATCHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "jobs_dispatched_total",
        "Total number of dispatch events accepted by the execution bus"
    )
    .expect("register jobs_dispatched_total")
});

pub static SCAN_CYCLE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "scan_cycle_duration_seconds",
        "Time taken for one shard scan cycle",
        &["shard_id"]
    )
    .expect("register scan_cycle_duration_seconds")
});

pub static DISPATCH_PUBLISH_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "dispatch_publish_duration_seconds",
        "Time taken to publish a dispatch event to the execution bus"
    )
    .expect("register dispatch_publish_duration_seconds")
});

pub static DISPATCH_PUBLISH_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "dispatch_publish_errors_total",
        "Total number of execution-bus publish errors"
    )
    .expect("register dispatch_publish_errors_total")
});

// Worker
pub static JOBS_EXECUTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "jobs_executed_total",
        "Total number of executed jobs by result",
        &["result"]
    )
    .expect("register jobs_executed_total")
});

pub static JOB_EXECUTION_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "job_execution_duration_seconds",
        "Time taken to process one dispatch event"
    )
    .expect("register job_execution_duration_seconds")
});

pub static BLOB_OPERATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "blob_operations_total",
        "Total number of blob-store operations",
        &["operation"]
    )
    .expect("register blob_operations_total")
});

// Coordinator
pub static SHARD_REBALANCES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "shard_rebalances_total",
        "Total number of assignment changes written by the coordinator"
    )
    .expect("register shard_rebalances_total")
});

pub static SWEEP_REPAIRS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sweep_repairs_total",
        "Total number of reconciliation-sweep repairs by action",
        &["action"]
    )
    .expect("register sweep_repairs_total")
});

async fn metrics_handler() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Serve the Prometheus text exposition on its own listener.
pub async fn serve_metrics(addr: SocketAddr, cancel: CancellationToken) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind metrics listener");
            return;
        }
    };

    tracing::info!(addr = %addr, "Metrics endpoint listening");

    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "Metrics server failed");
    }
}
