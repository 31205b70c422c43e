//! The agent's local metrics endpoint.
//!
//! Serves the snapshot document the broker pulls through the reverse
//! channel. The reverse dispatcher is just another HTTP client here, so
//! concurrent pulls and local debugging requests are both fine.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::{Arc, Mutex};
use telemon_collector::Collector;
use telemon_common::types::Metrics;

#[derive(Clone)]
pub struct ServerState {
    collectors: Arc<Mutex<Vec<Box<dyn Collector>>>>,
}

pub fn build_router(collectors: Vec<Box<dyn Collector>>) -> Router {
    let state = ServerState {
        collectors: Arc::new(Mutex::new(collectors)),
    };
    Router::new()
        .route("/health", get(health))
        .route("/run", get(run_all))
        .route("/run/:id", get(run_one))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn run_all(State(state): State<ServerState>) -> Json<Metrics> {
    let mut document = Metrics::new();
    let mut collectors = state.collectors.lock().unwrap_or_else(|e| e.into_inner());
    for collector in collectors.iter_mut() {
        match collector.collect() {
            Ok(metrics) => document.extend(metrics),
            Err(e) => {
                tracing::warn!(collector = collector.id(), error = %e, "collection failed");
            }
        }
    }
    Json(document)
}

async fn run_one(
    Path(id): Path<String>,
    State(state): State<ServerState>,
) -> Result<Json<Metrics>, StatusCode> {
    let mut collectors = state.collectors.lock().unwrap_or_else(|e| e.into_inner());
    let collector = collectors
        .iter_mut()
        .find(|c| c.id() == id)
        .ok_or(StatusCode::NOT_FOUND)?;
    match collector.collect() {
        Ok(metrics) => Ok(Json(metrics)),
        Err(e) => {
            tracing::warn!(collector = %id, error = %e, "collection failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
