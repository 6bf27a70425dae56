use axum::body::Body;
use axum::http::{Request, StatusCode};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tower::ServiceExt;

use readingflow::{Coordinator, NoopNotifier, PipelineConfig, SqliteTaskStore};
use readingflow_harness::{create_router, AppState};

async fn app() -> axum::Router {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteTaskStore::new(pool);
    store.run_migrations().await.unwrap();

    let coordinator = Arc::new(Coordinator::new(
        Arc::new(store),
        PipelineConfig::default(),
        Arc::new(NoopNotifier),
    ));
    create_router(AppState::new(coordinator))
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn reading_request() -> serde_json::Value {
    serde_json::json!({
        "owner_id": "user-1",
        "kind": "individual",
        "people": [{ "name": "Ada" }],
        "systems": ["western", "vedic"]
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let app = app().await;
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["status"], "ok");
}

#[tokio::test]
async fn submitted_job_is_queued_with_planned_total() {
    let app = app().await;

    let resp = app
        .clone()
        .oneshot(post_json("/jobs", reading_request()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let job_id = body_json(resp).await["job_id"].as_i64().unwrap();

    let req = Request::builder()
        .uri(format!("/jobs/{}", job_id))
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["job_id"], job_id);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["percent"], 0);
    assert_eq!(body["total"], 6);
    assert_eq!(body["tasks"].as_array().unwrap().len(), 2);
    assert!(body["artifacts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_request_is_unprocessable() {
    let app = app().await;
    let mut request = reading_request();
    request["systems"] = serde_json::json!([]);

    let resp = app.oneshot(post_json("/jobs", request)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("system"));
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let app = app().await;

    let req = Request::builder()
        .uri("/jobs/999")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app
        .oneshot(post_json("/jobs/999/cancel", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_is_only_effective_once() {
    let app = app().await;

    let resp = app
        .clone()
        .oneshot(post_json("/jobs", reading_request()))
        .await
        .unwrap();
    let job_id = body_json(resp).await["job_id"].as_i64().unwrap();
    let cancel_uri = format!("/jobs/{}/cancel", job_id);

    let resp = app
        .clone()
        .oneshot(post_json(&cancel_uri, serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["cancelled"], true);

    let resp = app
        .clone()
        .oneshot(post_json(&cancel_uri, serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["cancelled"], false);

    let req = Request::builder()
        .uri(format!("/jobs/{}", job_id))
        .body(Body::empty())
        .unwrap();
    let body = body_json(app.oneshot(req).await.unwrap()).await;
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["phase"], "cancelled");
}
