//! API route definitions.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use super::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/speed-test", post(start_speed_test))
        .route("/speed-test/start", get(start_speed_test))
        .route("/speed-test/latest", get(speed_test_latest))
        .route("/speed-test/history", get(speed_test_history))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

/// Runs a full test. Failures come back as a report with `error` set, never
/// as a 5xx.
async fn start_speed_test(State(state): State<AppState>) -> Json<Value> {
    let report = state.run_exclusive().await;
    Json(json!({ "data": report, "meta": meta() }))
}

async fn speed_test_latest(State(state): State<AppState>) -> Json<Value> {
    match state.latest().await {
        Some(report) => Json(json!({ "data": report, "meta": meta() })),
        None => Json(json!({ "data": null, "meta": { "message": "no speed test results yet" } })),
    }
}

async fn speed_test_history(State(state): State<AppState>) -> Json<Value> {
    let history = state.history().await;
    Json(json!({ "data": history, "meta": { "total": history.len() } }))
}
