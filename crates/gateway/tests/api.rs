//! HTTP surface tests: status codes, headers, and payload shapes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use ps_domain::config::Config;
use ps_gateway::api;
use ps_gateway::runtime::limiter::RateLimiter;
use ps_gateway::runtime::llm::LlmGateway;
use ps_gateway::runtime::orchestrator::SegmentationService;
use ps_gateway::runtime::stages::StageEngine;
use ps_gateway::state::AppState;
use ps_providers::{CompletionRequest, CompletionResponse, LlmProvider, Usage};
use ps_store::{
    BlobStore, Database, InteractionStore, SqliteAssignmentRepository,
    SqliteInteractionIndexRepository, SqliteProductCatalog, SqliteRunRepository,
    SqliteTaxonomyRepository,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deterministic provider: "Smart" titles vs the rest for extraction,
/// no-op refinement; consolidation never fires for single-batch runs.
struct KeywordProvider;

#[async_trait::async_trait]
impl LlmProvider for KeywordProvider {
    async fn complete(&self, req: CompletionRequest) -> ps_domain::Result<CompletionResponse> {
        let text = if req.prompt.contains("**SUBCATEGORIES:**") {
            "{}".to_string()
        } else {
            let mut segments: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
            for line in req.prompt.lines() {
                if let Some(rest) = line.strip_prefix('[') {
                    if let Some((idx, title)) = rest.split_once("] ") {
                        if let Ok(idx) = idx.parse::<usize>() {
                            let name = if title.contains("Smart") { "Smart" } else { "Manual" };
                            segments.entry(name).or_default().push(idx);
                        }
                    }
                }
            }
            let mut out = serde_json::Map::new();
            for (name, ids) in segments {
                out.insert(
                    name.to_string(),
                    serde_json::json!({ "definition": format!("{name} products"), "ids": ids }),
                );
            }
            serde_json::Value::Object(out).to_string()
        };
        Ok(CompletionResponse {
            text,
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 5,
            }),
            model: "stub".into(),
        })
    }

    fn provider_id(&self) -> &str {
        "keyword-stub"
    }
}

struct TestApp {
    router: Router,
    _tmp: tempfile::TempDir,
}

fn test_app() -> TestApp {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.storage_root = tmp.path().join("blobs");
    config.storage.db_path = tmp.path().join("segmentation.db");
    config.storage.prompt_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../prompts");
    config.server.progress_poll_ms = 20;
    let config = Arc::new(config);

    let prompts = Arc::new(
        ps_engine::prompts::PromptSet::load(&config.storage.prompt_dir).unwrap(),
    );
    let db = Arc::new(Database::open(&config.storage.db_path).unwrap());
    let runs = Arc::new(SqliteRunRepository::new(Arc::clone(&db)));
    let taxonomies = Arc::new(SqliteTaxonomyRepository::new(Arc::clone(&db)));
    let assignments = Arc::new(SqliteAssignmentRepository::new(Arc::clone(&db)));
    let interactions = Arc::new(SqliteInteractionIndexRepository::new(Arc::clone(&db)));
    let catalog = Arc::new(SqliteProductCatalog::new(Arc::clone(&db)));
    catalog
        .insert_products(&[
            (101, "WiFi Smart Dimmer"),
            (102, "Smart Switch Pro"),
            (103, "Manual Toggle Switch"),
        ])
        .unwrap();

    let store = Arc::new(InteractionStore::new(
        BlobStore::new(config.storage.storage_root.clone()).unwrap(),
        interactions,
    ));
    let limiter = Arc::new(RateLimiter::new(&config.limits, config.llm.max_tokens));
    let gateway = Arc::new(LlmGateway::new(
        Arc::new(KeywordProvider),
        limiter,
        Arc::clone(&store),
        config.llm.clone(),
    ));
    let engine = Arc::new(StageEngine::new(
        gateway,
        prompts,
        catalog,
        taxonomies.clone(),
        assignments.clone(),
        config.stages,
        config.llm.clone(),
    ));
    let service = Arc::new(SegmentationService::new(
        Arc::clone(&config),
        runs,
        taxonomies,
        assignments,
        engine,
        store,
    ));

    let state = AppState {
        config,
        service,
    };
    TestApp {
        router: api::router().with_state(state),
        _tmp: tmp,
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get(router: &Router, uri: &str) -> axum::response::Response {
    router
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn post_json(router: &Router, uri: &str, body: serde_json::Value) -> axum::response::Response {
    router
        .clone()
        .oneshot(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

/// Poll the run endpoint until the run is terminal.
async fn wait_for_terminal(router: &Router, run_id: &str) -> serde_json::Value {
    for _ in 0..200 {
        let response = get(router, &format!("/product-segmentation/{run_id}")).await;
        let json = body_json(response).await;
        let stage = json["stage"].as_str().unwrap_or_default().to_string();
        if stage == "completed" || stage == "failed" {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not reach a terminal stage");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn health_endpoint() {
    let app = test_app();
    let response = get(&app.router, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn start_returns_accepted_with_stream_location() {
    let app = test_app();
    let response = post_json(
        &app.router,
        "/product-segmentation",
        serde_json::json!({ "product_ids": [101, 102, 103], "product_category": "Lighting" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(location.starts_with("/product-segmentation/RUN_"));
    assert!(location.ends_with("/stream"));
}

#[tokio::test]
async fn empty_product_list_is_unprocessable() {
    let app = test_app();
    let response = post_json(
        &app.router,
        "/product-segmentation",
        serde_json::json!({ "product_ids": [], "product_category": "Lighting" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("empty"));
}

#[tokio::test]
async fn unknown_run_reads_are_not_found() {
    let app = test_app();
    let response = get(&app.router, "/product-segmentation/RUN_NOPE").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get(&app.router, "/product-segmentation/RUN_NOPE/segments").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn full_flow_start_then_segments() {
    let app = test_app();
    let response = post_json(
        &app.router,
        "/product-segmentation",
        serde_json::json!({ "product_ids": [101, 102, 103], "product_category": "Lighting" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let run_id = location
        .trim_start_matches("/product-segmentation/")
        .trim_end_matches("/stream")
        .to_string();

    let terminal = wait_for_terminal(&app.router, &run_id).await;
    assert_eq!(terminal["stage"], "completed");
    assert_eq!(terminal["percent"], 100.0);

    let response = get(&app.router, &format!("/product-segmentation/{run_id}/segments")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;

    assert_eq!(json["run_id"], run_id.as_str());
    let taxonomies = json["taxonomies"].as_array().unwrap();
    assert_eq!(taxonomies.len(), 2);
    let counts: BTreeMap<&str, i64> = taxonomies
        .iter()
        .map(|t| {
            (
                t["segment_name"].as_str().unwrap(),
                t["product_count"].as_i64().unwrap(),
            )
        })
        .collect();
    assert_eq!(counts["Smart"], 2);
    assert_eq!(counts["Manual"], 1);
    assert_eq!(json["segments"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn run_listing_includes_created_runs() {
    let app = test_app();
    post_json(
        &app.router,
        "/product-segmentation",
        serde_json::json!({ "product_ids": [101], "product_category": "Lighting" }),
    )
    .await;

    let response = get(&app.router, "/product-segmentation").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["count"], 1);
    assert!(json["runs"][0]["run_id"]
        .as_str()
        .unwrap()
        .starts_with("RUN_"));
}

#[tokio::test]
async fn run_listing_filters_by_stage() {
    let app = test_app();
    let response = post_json(
        &app.router,
        "/product-segmentation",
        serde_json::json!({ "product_ids": [101], "product_category": "Lighting" }),
    )
    .await;
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let run_id = location
        .trim_start_matches("/product-segmentation/")
        .trim_end_matches("/stream")
        .to_string();
    wait_for_terminal(&app.router, &run_id).await;

    let response = get(&app.router, "/product-segmentation?stage=completed").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["count"], 1);

    let response = get(&app.router, "/product-segmentation?stage=failed").await;
    let json = body_json(response).await;
    assert_eq!(json["count"], 0);

    let response = get(&app.router, "/product-segmentation?stage=bogus").await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn stream_emits_progress_and_closes_on_terminal_run() {
    let app = test_app();
    let response = post_json(
        &app.router,
        "/product-segmentation",
        serde_json::json!({ "product_ids": [101, 102, 103], "product_category": "Lighting" }),
    )
    .await;
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let run_id = location
        .trim_start_matches("/product-segmentation/")
        .trim_end_matches("/stream")
        .to_string();
    wait_for_terminal(&app.router, &run_id).await;

    let response = get(&app.router, &location).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    // Terminal run: one progress event, then the stream ends.
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("event: progress"));
    assert!(body.contains("\"stage\":\"completed\""));
    assert!(body.contains("\"percent\":100.0"));
}

#[tokio::test]
async fn stream_for_unknown_run_emits_error_event() {
    let app = test_app();
    let response = get(&app.router, "/product-segmentation/RUN_NOPE/stream").await;
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("event: error"));
    assert!(body.contains("run not found"));
}
