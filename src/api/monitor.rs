use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::queue::QueueStats;
use crate::services::reference_store::CacheStats;

use super::AppState;

#[derive(Serialize)]
struct SystemStats {
    cpus: usize,
}

#[derive(Serialize)]
struct SubmissionStats {
    tracked_sessions: usize,
}

#[derive(Serialize)]
struct MonitorResponse {
    timestamp: DateTime<Utc>,
    queue: QueueStats,
    reference_cache: CacheStats,
    submissions: SubmissionStats,
    system: SystemStats,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/monitor", get(monitor))
}

/// Operational statistics: queue depth, worker pool, cache and write flags.
async fn monitor(State(state): State<AppState>) -> Json<MonitorResponse> {
    Json(MonitorResponse {
        timestamp: Utc::now(),
        queue: state.queue.stats(),
        reference_cache: state.references.stats().await,
        submissions: SubmissionStats {
            tracked_sessions: state.submissions.tracked_sessions().await,
        },
        system: SystemStats {
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        },
    })
}
