use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::geofence::Coordinate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Expired,
    ReportSent,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::ReportSent => "report_sent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "expired" => Some(SessionStatus::Expired),
            "report_sent" => Some(SessionStatus::ReportSent),
            _ => None,
        }
    }
}

/// A participant admitted to a session's roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub participant_id: String,
    pub display_name: String,
}

/// An OTP-gated attendance session.
///
/// Sessions move `Active -> Expired -> ReportSent` and are never deleted
/// before the report has been emitted; the sweep garbage-collects them once
/// they fall outside the retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub code: String,
    pub owner_id: String,
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
    pub roster: Vec<RosterEntry>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub report_sent_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status != SessionStatus::Active || now >= self.expires_at
    }

    pub fn contains_participant(&self, participant_id: &str) -> bool {
        self.roster
            .iter()
            .any(|entry| entry.participant_id == participant_id)
    }

    pub fn display_name_for(&self, participant_id: &str) -> Option<&str> {
        self.roster
            .iter()
            .find(|entry| entry.participant_id == participant_id)
            .map(|entry| entry.display_name.as_str())
    }

    /// Geofence center the owner shared at session start.
    pub fn center(&self) -> Result<Coordinate, crate::services::geofence::GeofenceError> {
        Coordinate::new(self.latitude, self.longitude)
    }
}
