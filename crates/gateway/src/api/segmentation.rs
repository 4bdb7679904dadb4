//! Product segmentation API endpoints.
//!
//! - `POST /product-segmentation`                    — create a run, execute asynchronously
//! - `GET  /product-segmentation`                    — list recent runs
//! - `GET  /product-segmentation/:run_id`            — run record + derived percent
//! - `GET  /product-segmentation/:run_id/stream`     — SSE progress stream
//! - `GET  /product-segmentation/:run_id/segments`   — final taxonomies + assignments

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use ps_domain::error::Error;
use ps_domain::run::SegmentRun;

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Map a domain error onto the HTTP surface.
fn from_domain(e: Error) -> Response {
    match e {
        Error::InvalidInput(msg) => api_error(StatusCode::UNPROCESSABLE_ENTITY, msg),
        Error::NotFound(msg) => api_error(StatusCode::NOT_FOUND, msg),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

fn run_json(run: &SegmentRun) -> serde_json::Value {
    serde_json::json!({
        "run_id": run.id,
        "stage": run.stage,
        "percent": run.percent(),
        "total_products": run.total_products,
        "processed_products": run.processed_products,
        "product_category": run.product_category,
        "created_at": run.created_at,
        "result_summary": run.result_summary,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /product-segmentation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct StartSegmentationRequest {
    pub product_ids: Vec<i64>,
    pub product_category: String,
}

/// Create a run and kick off execution in the background. Responds
/// `202 Accepted` with a `Location` header pointing at the progress
/// stream; no body.
pub async fn start(
    State(state): State<AppState>,
    Json(req): Json<StartSegmentationRequest>,
) -> Response {
    let run_id = match state
        .service
        .create_run(&req.product_ids, &req.product_category)
        .await
    {
        Ok(id) => id,
        Err(e) => return from_domain(e),
    };

    let service = state.service.clone();
    let spawn_id = run_id.clone();
    tokio::spawn(async move {
        // Failures are recorded on the run; the stream surfaces them.
        let _ = service.execute_run(&spawn_id).await;
    });

    let location = format!("/product-segmentation/{run_id}/stream");
    let mut response = StatusCode::ACCEPTED.into_response();
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /product-segmentation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Optional stage filter (e.g. `?stage=failed`).
    #[serde(default)]
    pub stage: Option<String>,
}

fn default_limit() -> usize {
    20
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(q): Query<ListRunsQuery>,
) -> Response {
    let runs = match q.stage.as_deref() {
        Some(raw) => match ps_domain::run::Stage::parse(raw) {
            Some(stage) => state.service.runs_by_stage(stage).await,
            None => {
                return api_error(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    format!("unknown stage '{raw}'"),
                )
            }
        },
        None => state.service.recent_runs(q.limit.min(100)).await,
    };

    match runs {
        Ok(runs) => {
            let items: Vec<serde_json::Value> = runs.iter().map(run_json).collect();
            Json(serde_json::json!({ "runs": items, "count": items.len() })).into_response()
        }
        Err(e) => from_domain(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /product-segmentation/:run_id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.service.get_run(&run_id).await {
        Ok(run) => Json(run_json(&run)).into_response(),
        Err(e) => from_domain(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /product-segmentation/:run_id/stream (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Poll the run record and emit a `progress` event whenever the derived
/// percent (or the stage) changes. The stream closes once the run reaches
/// a terminal stage or the client disconnects; an unknown run yields a
/// single `error` event.
pub async fn stream(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    let poll = Duration::from_millis(state.config.server.progress_poll_ms);
    let service = state.service.clone();

    let stream = async_stream::stream! {
        let mut last: Option<(f64, ps_domain::run::Stage)> = None;
        loop {
            match service.get_run(&run_id).await {
                Ok(run) => {
                    let current = (run.percent(), run.stage);
                    if last != Some(current) {
                        last = Some(current);
                        let data = serde_json::json!({
                            "run_id": run.id,
                            "percent": current.0,
                            "stage": run.stage,
                        })
                        .to_string();
                        yield Ok::<_, Infallible>(Event::default().event("progress").data(data));
                    }
                    if run.stage.is_terminal() {
                        break;
                    }
                }
                Err(_) => {
                    let data = serde_json::json!({
                        "run_id": run_id,
                        "error": "run not found",
                    })
                    .to_string();
                    yield Ok(Event::default().event("error").data(data));
                    break;
                }
            }
            tokio::time::sleep(poll).await;
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /product-segmentation/:run_id/segments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Final results; a failed run returns whatever partial data exists.
pub async fn segments(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.service.get_results(&run_id).await {
        Ok(results) => Json(serde_json::json!(results)).into_response(),
        Err(e) => from_domain(e),
    }
}
