//! Submission ingress: the HTTP surface plus the submit pipeline (identity
//! assignment, payload offload, persistence ordering, write-bus publish).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::bus::WriteBus;
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::metrics;
use crate::model::job::{shard_for, BLOB_REF_PREFIX};
use crate::model::{Job, JobStatus, SubmissionEvent};
use crate::schedule::Recurrence;
use crate::store::{BlobStore, JobStore, UserJobEntry};

#[derive(Clone)]
pub struct IngressState {
    pub job_store: Arc<dyn JobStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub write_bus: Arc<dyn WriteBus>,
    pub config: SchedulerConfig,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub cron_schedule: String,
    /// RFC3339, or empty for "now".
    #[serde(default)]
    pub next_fire_at: String,
    #[serde(default)]
    pub max_retries: i32,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: String,
    pub message: String,
}

/// Maps pipeline failures onto the API's status codes.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Validation(msg) => Self::new(StatusCode::BAD_REQUEST, msg),
            SchedulerError::Schedule { .. } => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            SchedulerError::JobNotFound(_) => Self::new(StatusCode::NOT_FOUND, "Job not found"),
            SchedulerError::Storage(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Storage Error")
            }
            SchedulerError::Bus(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Messaging Error")
            }
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub fn router(state: IngressState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/submit", post(submit_handler))
        .route("/job", get(get_job_handler))
        .route("/jobs", get(list_jobs_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the submission API until the token is cancelled.
pub async fn serve(addr: SocketAddr, state: IngressState, cancel: CancellationToken) {
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind ingress listener");
            return;
        }
    };

    tracing::info!(addr = %addr, "Ingress listening");

    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "Ingress server failed");
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn submit_handler(
    State(state): State<IngressState>,
    headers: HeaderMap,
    Json(req): Json<SubmitRequest>,
) -> std::result::Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let start = Instant::now();
    let user_id = header_value(&headers, "X-User-ID");

    let result = submit_job(&state, req, &user_id).await;

    let status_label = match &result {
        Ok(_) => "201",
        Err(e) => match e {
            SchedulerError::Validation(_) | SchedulerError::Schedule { .. } => "400",
            SchedulerError::Bus(_) | SchedulerError::Storage(_) => "500",
            _ => "500",
        },
    };
    metrics::HTTP_REQUEST_DURATION
        .with_label_values(&["POST", "/submit"])
        .observe(start.elapsed().as_secs_f64());
    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/submit", status_label])
        .inc();

    let job_id = result?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            job_id: job_id.to_string(),
            status: "Submitted".to_string(),
            message: "Job submitted successfully".to_string(),
        }),
    ))
}

/// The submit pipeline: offload, persist, index, publish. The caller only
/// sees success after the write-bus accepted the submission event.
pub async fn submit_job(
    state: &IngressState,
    req: SubmitRequest,
    user_id: &str,
) -> Result<Uuid> {
    let job_id = Uuid::new_v4();
    let now = Utc::now();
    let shard_id = shard_for(&job_id, state.config.shard_count);

    let next_fire_at = if req.next_fire_at.is_empty() {
        now
    } else {
        DateTime::parse_from_rfc3339(&req.next_fire_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| {
                SchedulerError::Validation(
                    "Invalid next_fire_at format (RFC3339 required)".to_string(),
                )
            })?
    };

    if !req.cron_schedule.is_empty() {
        Recurrence::parse(&req.cron_schedule)?;
    }

    metrics::JOBS_CREATED_TOTAL.with_label_values(&[user_id]).inc();

    // Offload oversized payloads before anything references them.
    let payload = if req.payload.len() > state.config.inline_payload_max {
        let blob_start = Instant::now();
        let key = format!("payloads/{job_id}");
        state
            .blob_store
            .put(&key, req.payload.into_bytes())
            .await
            .map_err(|e| SchedulerError::Storage(format!("payload offload failed: {e}")))?;
        metrics::PAYLOAD_STORAGE_DURATION
            .with_label_values(&["blob"])
            .observe(blob_start.elapsed().as_secs_f64());
        metrics::BLOB_OPERATIONS_TOTAL
            .with_label_values(&["upload"])
            .inc();
        format!("{BLOB_REF_PREFIX}{key}")
    } else {
        metrics::PAYLOAD_STORAGE_DURATION
            .with_label_values(&["inline"])
            .observe(0.0);
        req.payload
    };

    let job = Job {
        job_id,
        project_id: req.project_id.clone(),
        user_id: user_id.to_string(),
        payload: payload.clone(),
        cron_schedule: req.cron_schedule,
        next_fire_at,
        status: JobStatus::Pending,
        created_at: now,
        updated_at: now,
        max_retries: req.max_retries,
        retry_count: 0,
        shard_id,
    };

    // Canonical state first.
    state.job_store.insert_job(&job).await?;

    // The user index is a projection; failure here is logged and left to
    // reconciliation.
    if !user_id.is_empty() {
        let entry = UserJobEntry {
            user_id: user_id.to_string(),
            created_at: now,
            job_id,
            status: JobStatus::Pending,
            next_fire_at,
        };
        if let Err(e) = state.job_store.upsert_user_job(&entry).await {
            tracing::warn!(job_id = %job_id, error = %e, "User index write failed (non-fatal)");
        }
    }

    // Then the propagation record. The 201 depends on this publish.
    let event = SubmissionEvent {
        job_id,
        project_id: req.project_id,
        user_id: user_id.to_string(),
        next_fire_at,
        submitted_at: now,
        shard_id,
        payload,
        max_retries: req.max_retries,
    };
    let body = serde_json::to_vec(&event)
        .map_err(|e| SchedulerError::Internal(e.to_string()))?;

    let publish_start = Instant::now();
    let published = state.write_bus.publish(&job_id.to_string(), body).await;
    metrics::SUBMIT_PUBLISH_DURATION.observe(publish_start.elapsed().as_secs_f64());

    if let Err(e) = published {
        metrics::SUBMIT_PUBLISH_ERRORS.inc();
        tracing::error!(job_id = %job_id, error = %e, "Write-bus publish failed; job is orphaned-PENDING until reconciliation");
        return Err(SchedulerError::Bus(e.to_string()));
    }

    tracing::info!(job_id = %job_id, shard_id, next_fire_at = %next_fire_at, "Job submitted");
    Ok(job_id)
}

#[derive(Debug, Deserialize)]
struct JobQuery {
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobView {
    job_id: String,
    project_id: String,
    payload: String,
    status: String,
    next_fire_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cron_schedule: Option<String>,
}

async fn get_job_handler(
    State(state): State<IngressState>,
    Query(query): Query<JobQuery>,
) -> std::result::Result<Json<JobView>, ApiError> {
    let id = query
        .id
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Missing id parameter"))?;
    let job_id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid id parameter"))?;

    let job = state
        .job_store
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Job not found"))?;

    Ok(Json(JobView {
        job_id: job.job_id.to_string(),
        project_id: job.project_id,
        payload: job.payload,
        status: job.status.to_string(),
        next_fire_at: job.next_fire_at,
        created_at: job.created_at,
        cron_schedule: if job.cron_schedule.is_empty() {
            None
        } else {
            Some(job.cron_schedule)
        },
    }))
}

#[derive(Debug, Serialize)]
struct UserJobView {
    job_id: String,
    status: String,
    next_fire_at: String,
    created_at: String,
}

async fn list_jobs_handler(
    State(state): State<IngressState>,
    headers: HeaderMap,
) -> std::result::Result<Json<Vec<UserJobView>>, ApiError> {
    let start = Instant::now();
    let user_id = header_value(&headers, "X-User-ID");
    if user_id.is_empty() {
        metrics::HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/jobs", "400"])
            .inc();
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Missing X-User-ID header",
        ));
    }

    let entries = state.job_store.user_jobs(&user_id).await?;
    let views = entries
        .into_iter()
        .map(|e| UserJobView {
            job_id: e.job_id.to_string(),
            status: e.status.to_string(),
            next_fire_at: e.next_fire_at.to_rfc3339(),
            created_at: e.created_at.to_rfc3339(),
        })
        .collect();

    metrics::HTTP_REQUEST_DURATION
        .with_label_values(&["GET", "/jobs"])
        .observe(start.elapsed().as_secs_f64());
    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/jobs", "200"])
        .inc();

    Ok(Json(views))
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
