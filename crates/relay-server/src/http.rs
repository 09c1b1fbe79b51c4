use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use relay_core::envelope::AggressiveMeta;
use relay_core::error::{codes, ApiError};
use relay_core::facade::ControlPlane;
use relay_core::queue::{ResultLookup, SubmitOptions};
use relay_core::replay::{ReplayCase, ReplayRequest};

use crate::metrics;

type ApiErrorResponse = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AppState {
    pub plane: Arc<ControlPlane>,
}

pub fn router(plane: Arc<ControlPlane>) -> Router {
    let api = Router::new()
        .route("/async/submit", post(submit_job))
        .route("/async/status/{job_id}", get(job_status))
        .route("/async/result/{job_id}", get(job_result))
        .route("/async/cancel/{job_id}", post(cancel_job))
        .route("/async/queue", get(queue_view))
        .route("/async/state", get(state_view))
        .route("/async/metrics", get(metrics_view))
        .route("/async/aggressive/report", get(aggressive_view))
        .route("/async/review/{job_id}", get(review_view))
        .route("/replay/run", post(replay_run))
        .route("/replay/report/{replay_id}", get(replay_report_view));

    Router::new()
        .nest("/api", api)
        .route("/health", get(health))
        .route("/metrics", get(prometheus_view))
        .layer(middleware::from_fn(track_http_metrics))
        .with_state(AppState { plane })
}

async fn track_http_metrics(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let response = next.run(req).await;
    metrics::observe_http_request(
        &route,
        &method,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

fn api_error(err: ApiError) -> ApiErrorResponse {
    let status =
        StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.public_body()))
}

#[derive(Debug, Deserialize)]
struct AggressiveBody {
    #[serde(default)]
    enabled: bool,
    #[serde(default, rename = "fallbackReason")]
    fallback_reason: Option<String>,
    #[serde(default, rename = "confidenceBefore")]
    confidence_before: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    aggressive: Option<AggressiveBody>,
    #[serde(default, rename = "domAnchor")]
    dom_anchor: Option<Value>,
    #[serde(default, rename = "screenshotRegion")]
    screenshot_region: Option<Value>,
    #[serde(default, rename = "reasoningNote")]
    reasoning_note: Option<String>,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiErrorResponse> {
    let body: SubmitBody = serde_json::from_value(body)
        .map_err(|err| api_error(ApiError::invalid_request(format!("Invalid submit body: {err}"))))?;

    let (aggressive, confidence_before) = match body.aggressive {
        Some(aggressive) => (
            AggressiveMeta {
                enabled: aggressive.enabled,
                fallback_reason: aggressive.fallback_reason,
            },
            aggressive.confidence_before,
        ),
        None => (AggressiveMeta::default(), None),
    };

    let ack = state
        .plane
        .submit(
            body.payload,
            SubmitOptions {
                priority: body.priority,
                aggressive,
                confidence_before,
                dom_anchor: body.dom_anchor,
                screenshot_region: body.screenshot_region,
                reasoning_note: body.reasoning_note,
            },
        )
        .map_err(api_error)?;

    let ack = serde_json::to_value(ack)
        .map_err(|err| api_error(ApiError::new(500, codes::INTERNAL_ERROR, err.to_string(), false)))?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiErrorResponse> {
    match state.plane.status_view(&job_id) {
        Some(view) => Ok(Json(json!(view))),
        None => Err(api_error(ApiError::job_not_found(&job_id))),
    }
}

async fn job_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiErrorResponse> {
    match state.plane.result_lookup(&job_id) {
        ResultLookup::Ready(envelope) => Ok((StatusCode::OK, Json(json!(envelope)))),
        ResultLookup::Pending(status) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({"job_id": job_id, "status": status})),
        )),
        ResultLookup::Unknown => Err(api_error(ApiError::job_not_found(&job_id))),
    }
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    ok: bool,
    job_id: String,
    status: String,
    running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiErrorResponse> {
    let outcome = state.plane.cancel(&job_id);
    if outcome.code == Some(codes::JOB_NOT_FOUND) {
        return Err(api_error(ApiError::job_not_found(&job_id)));
    }
    Ok(Json(CancelResponse {
        ok: outcome.cancelled,
        job_id,
        status: outcome.status,
        running: outcome.running,
        code: outcome.code,
    }))
}

async fn queue_view(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.plane.queue_snapshot()))
}

async fn state_view(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.plane.get_state().await))
}

async fn metrics_view(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.plane.get_metrics()))
}

async fn aggressive_view(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"aggressive": state.plane.aggressive_report()}))
}

async fn review_view(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiErrorResponse> {
    match state.plane.review_payload(&job_id) {
        Some(review) => Ok(Json(json!(review))),
        None => Err(api_error(ApiError::job_not_found(&job_id))),
    }
}

#[derive(Debug, Deserialize)]
struct ReplayBody {
    #[serde(default, rename = "replayName")]
    replay_name: Option<String>,
    #[serde(default, rename = "baselineModel")]
    baseline_model: Option<String>,
    #[serde(default, rename = "candidateModel")]
    candidate_model: Option<String>,
    #[serde(default)]
    cases: Option<Vec<ReplayCase>>,
}

async fn replay_run(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiErrorResponse> {
    let body: ReplayBody = serde_json::from_value(body)
        .map_err(|err| api_error(ApiError::invalid_request(format!("Invalid replay body: {err}"))))?;

    let (Some(baseline_model), Some(candidate_model), Some(cases)) =
        (body.baseline_model, body.candidate_model, body.cases)
    else {
        return Err(api_error(ApiError::invalid_request(
            "baselineModel, candidateModel, and cases are required.",
        )));
    };

    let report = state
        .plane
        .run_replay(ReplayRequest {
            replay_name: body.replay_name.unwrap_or_default(),
            baseline_model,
            candidate_model,
            cases,
        })
        .await
        .map_err(api_error)?;
    Ok(Json(json!(report)))
}

async fn replay_report_view(
    State(state): State<AppState>,
    Path(replay_id): Path<String>,
) -> Result<Json<Value>, ApiErrorResponse> {
    match state.plane.replay_report(&replay_id) {
        Some(report) => Ok(Json(json!(report))),
        None => Err(api_error(ApiError::new(
            404,
            codes::JOB_NOT_FOUND,
            format!("No replay report with id {replay_id}."),
            false,
        ))),
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn prometheus_view() -> Response {
    match metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
