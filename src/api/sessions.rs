use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::RosterEntry;
use crate::services::geofence::Coordinate;
use crate::services::session_manager::{EnrollmentReceipt, ReportError, SessionReport};

use super::AppState;

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    owner_id: String,
    label: String,
    latitude: f64,
    longitude: f64,
    roster: Vec<RosterEntry>,
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    session_id: Uuid,
    code: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SubmissionRequest {
    participant_id: String,
    latitude: f64,
    longitude: f64,
    /// Raw probe media, base64-encoded.
    probe: String,
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    session_id: Uuid,
    code: String,
    label: String,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    roster_size: usize,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:code", get(get_session))
        .route("/api/sessions/:code/submissions", post(submit))
        .route("/api/sessions/:code/report", get(get_report))
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), AppError> {
    let center = Coordinate::new(body.latitude, body.longitude)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let session = state
        .manager
        .create_session(&body.owner_id, &body.label, center, body.roster)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id,
            code: session.code,
            expires_at: session.expires_at,
        }),
    ))
}

async fn get_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<SessionSummary>, AppError> {
    let session = state
        .manager
        .store()
        .find_latest_by_code(&code)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no session for code {code}")))?;

    Ok(Json(SessionSummary {
        session_id: session.id,
        code: session.code,
        label: session.label,
        status: session.status.as_str().to_string(),
        created_at: session.created_at,
        expires_at: session.expires_at,
        roster_size: session.roster.len(),
    }))
}

/// Accepts an identity-proof submission. Validation failures return
/// immediately; an accepted probe is queued and the verdict is delivered
/// asynchronously to the participant's message channel.
async fn submit(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(body): Json<SubmissionRequest>,
) -> Result<(StatusCode, Json<EnrollmentReceipt>), AppError> {
    let location = Coordinate::new(body.latitude, body.longitude)
        .map_err(|e| AppError::Validation(e.to_string()))?;
    let probe = BASE64
        .decode(body.probe.as_bytes())
        .map_err(|e| AppError::Validation(format!("probe is not valid base64: {e}")))?;
    if probe.is_empty() {
        return Err(AppError::Validation("probe media is empty".to_string()));
    }

    let receipt = state
        .manager
        .enroll(&code, &body.participant_id, location, probe)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn get_report(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<SessionReport>, AppError> {
    let report = state
        .manager
        .report_for_code(&code)
        .await
        .map_err(|e| match e {
            ReportError::Store(e) => AppError::Store(e),
            ReportError::Api(e) => AppError::Internal(anyhow::anyhow!(e)),
        })?
        .ok_or_else(|| AppError::NotFound(format!("no session for code {code}")))?;

    Ok(Json(report))
}
