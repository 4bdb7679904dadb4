pub mod segmentation;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/product-segmentation",
            post(segmentation::start).get(segmentation::list_runs),
        )
        .route("/product-segmentation/:run_id", get(segmentation::get_run))
        .route(
            "/product-segmentation/:run_id/stream",
            get(segmentation::stream),
        )
        .route(
            "/product-segmentation/:run_id/segments",
            get(segmentation::segments),
        )
        .route("/health", get(health))
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}
