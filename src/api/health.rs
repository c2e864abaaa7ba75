use std::time::Instant;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;

#[derive(Serialize)]
struct ServiceHealth {
    status: String,
    response_time_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    record_api: ServiceHealth,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/health/deep", get(deep_health))
}

/// Deep health check: probes the external record API.
async fn deep_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let start = Instant::now();
    let record_api = match state.record_api.ping().await {
        Ok(()) => ServiceHealth {
            status: "healthy".to_string(),
            response_time_ms: start.elapsed().as_millis(),
            error: None,
        },
        Err(e) => ServiceHealth {
            status: "unhealthy".to_string(),
            response_time_ms: start.elapsed().as_millis(),
            error: Some(format!("Record API error: {}", e)),
        },
    };

    let status = if record_api.status == "healthy" {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        record_api,
    })
}
