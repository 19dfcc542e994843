//! Job admission, status, cancellation, and timing metrics.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

use crate::api::error::ApiError;
use crate::api::protocol::{CancelActiveResponse, EnqueueResponse, JobStatusResponse, OkResponse};
use crate::api::server::AppState;
use crate::auth::anon;
use crate::core::JobKind;
use crate::pipeline::GenerateRequest;
use crate::store::jobs::JobSnapshot;

/// `POST /api/v1/generate` — admit a job into the caller's queue.
pub async fn generate(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let anon_id = anon::anon_id_from_jar(&jar);
    let payload = serde_json::to_value(&request)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let job = state
        .scheduler
        .enqueue(&anon_id, JobKind::Generate, payload)
        .map_err(|err| {
            tracing::info!(owner_id = %anon_id, error = %err, "enqueue rejected");
            ApiError::from(err)
        })?;
    let position = state.scheduler.position(&job.id);
    tracing::info!(owner_id = %anon_id, job_id = %job.id, position = ?position, "job enqueued");
    Ok(Json(EnqueueResponse {
        job_id: job.id,
        status: "queued",
        position,
    }))
}

/// `GET /api/v1/jobs/{id}` — status snapshot.
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state
        .scheduler
        .get(&job_id)
        .ok_or_else(|| ApiError::not_found("Job not found"))?;
    Ok(Json(JobStatusResponse {
        position: state.scheduler.position(&job_id),
        id: job.id,
        status: job.status.to_string(),
        progress: job.progress,
        result: job.result,
        error: job.error_message,
    }))
}

/// `POST /api/v1/jobs/{id}/cancel` — cancel one job by id.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    if !state.scheduler.cancel(&job_id) {
        return Err(ApiError::bad_request("Job not found or not cancellable"));
    }
    Ok(Json(OkResponse::ok()))
}

/// `POST /api/v1/cancel` — cancel the caller's running job.
pub async fn cancel_active(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Json<CancelActiveResponse>, ApiError> {
    let anon_id = anon::anon_id_from_jar(&jar);
    let job = state
        .scheduler
        .active_for_owner(&anon_id)
        .ok_or_else(|| ApiError::bad_request("No active generation to cancel."))?;
    if !state.scheduler.cancel(&job.id) {
        return Err(ApiError::internal(&"cancel dispatch failed"));
    }
    state.hub.send_to_user(
        &anon_id,
        &json!({ "status": "cancelling", "job_id": job.id }),
    );
    Ok(Json(CancelActiveResponse {
        message: "Cancel request sent.",
        job_id: job.id,
    }))
}

/// Query parameters of the metrics endpoint.
#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    /// Window size.
    #[serde(default = "default_metrics_limit")]
    pub limit: i64,
}

fn default_metrics_limit() -> i64 {
    50
}

/// ETA metrics: aggregate timing only, no ids or paths.
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    /// Mean duration across the window, seconds.
    pub overall_avg_sec: Option<f64>,
    /// Mean duration per workflow id.
    pub per_workflow_avg_sec: HashMap<String, f64>,
    /// Completed jobs in the window.
    pub count: usize,
}

/// `GET /api/v1/jobs/metrics` — rolling averages for frontend ETAs.
///
/// Prefers persisted snapshots (they survive restarts); falls back to
/// the in-memory registry when the store is unreadable.
pub async fn metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Json<MetricsResponse> {
    let limit = query.limit.clamp(1, 500);
    match state.jobs.fetch_recent(limit).await {
        Ok(rows) => Json(averages_from_snapshots(&rows)),
        Err(err) => {
            tracing::warn!(error = %err, "metrics from store failed, using registry");
            let avg = state.scheduler.recent_averages(usize::try_from(limit).unwrap_or(50));
            Json(MetricsResponse {
                overall_avg_sec: avg.overall_avg_sec,
                per_workflow_avg_sec: avg.per_workflow_avg_sec.into_iter().collect(),
                count: avg.count,
            })
        }
    }
}

/// Average durations of completed snapshot rows. Rows carry no payload,
/// so the per-workflow split stays empty on this path.
#[must_use]
pub fn averages_from_snapshots(rows: &[JobSnapshot]) -> MetricsResponse {
    let durations: Vec<f64> = rows
        .iter()
        .filter(|row| row.status == "complete")
        .filter_map(|row| match (row.started_at, row.ended_at) {
            (Some(start), Some(end)) => Some((end - start).max(0.0)),
            _ => None,
        })
        .collect();
    let overall = if durations.is_empty() {
        None
    } else {
        Some(durations.iter().sum::<f64>() / durations.len() as f64)
    };
    MetricsResponse {
        overall_avg_sec: overall,
        per_workflow_avg_sec: HashMap::new(),
        count: durations.len(),
    }
}
