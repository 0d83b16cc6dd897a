#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use cumulus::server::{router, ServerState};
use cumulus::{AggregationStrategy, MemoryStore, MetricSpec};
use tower::ServiceExt;

fn catalog() -> HashMap<String, MetricSpec> {
    let mut m = HashMap::new();
    m.insert(
        "cpu_load".to_string(),
        MetricSpec {
            frequency: 10,
            aggregation: AggregationStrategy::None,
        },
    );
    m.insert(
        "temp".to_string(),
        MetricSpec {
            frequency: 10,
            aggregation: AggregationStrategy::Avg,
        },
    );
    m
}

fn app() -> (Arc<MemoryStore>, axum::Router) {
    let store = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let state = Arc::new(ServerState::new(Arc::clone(&store), None));
    (store, router(state))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn write_then_query() {
    let (_store, app) = app();

    let response = app
        .clone()
        .oneshot(
            Request::post("/write?cluster=alex")
                .body(Body::from(
                    "cpu_load,hostname=a0603 value=0.5 1690000000\n",
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary = body_json(response).await;
    assert_eq!(summary["accepted"], 1);

    let query = serde_json::json!({
        "cluster": "alex",
        "from": 1690000000i64,
        "to": 1690000010i64,
        "with-stats": true,
        "queries": [{ "metric": "cpu_load", "hostname": "a0603" }]
    });
    let response = app
        .oneshot(
            Request::post("/query")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(query.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["results"][0][0]["data"][0], 0.5);
    assert_eq!(body["results"][0][0]["avg"], 0.5);
    assert!(body["results"][0][0]["error"].is_null());
}

#[tokio::test]
async fn query_errors_are_reported_inline() {
    let (_store, app) = app();
    let query = serde_json::json!({
        "cluster": "alex",
        "from": 100i64,
        "to": 200i64,
        "queries": [{ "metric": "cpu_load", "hostname": "nope" }]
    });
    let response = app
        .oneshot(
            Request::post("/query")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(query.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["results"][0][0]["error"].is_string());
}

#[tokio::test]
async fn free_endpoint_releases_buffers() {
    let (store, app) = app();
    store
        .write(
            &["c".to_string(), "h".to_string()],
            &[cumulus::Sample::new("cpu_load", 1.0, 1000)],
        )
        .unwrap();
    assert!(store.size_in_bytes() > 0);

    let response = app
        .oneshot(
            Request::post("/free")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"[["c","h"]]"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.size_in_bytes(), 0);
}

#[tokio::test]
async fn healthcheck_reports_unmonitored_nodes() {
    let (_store, app) = app();
    let response = app
        .oneshot(
            Request::get("/healthcheck?cluster=c&node=h")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "Unhealthy");
}

#[tokio::test]
async fn debug_dump_shows_the_tree() {
    let (store, app) = app();
    store
        .write(
            &["c".to_string(), "h".to_string(), "core0".to_string()],
            &[cumulus::Sample::new("temp", 42.0, 1000)],
        )
        .unwrap();

    let response = app
        .oneshot(
            Request::post("/debug?selector=c:h")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["children"]["core0"]["metrics"]["temp"]["samples"], 1);
}
