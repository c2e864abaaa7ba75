use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::models::{RosterEntry, Session, SessionStatus};
use crate::queue::{QueueFull, VerificationQueue, VerificationTask};
use crate::services::geofence::{self, Coordinate, GeofenceError};
use crate::services::record_api::{RecordApi, SessionContext};
use crate::services::retry_tracker::RetryTracker;
use crate::services::submission::SubmissionCoordinator;
use crate::store::{SessionStore, StoreError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("an active session for '{label}' already exists for this owner today")]
    DuplicateSession { owner_id: String, label: String },

    #[error("could not allocate a unique session code after {attempts} attempts")]
    CodeExhaustion { attempts: u32 },

    #[error("session roster must not be empty")]
    EmptyRoster,

    #[error(transparent)]
    Geofence(#[from] GeofenceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no active session for code {code}")]
    UnknownCode { code: String },

    #[error("session {code} has expired")]
    SessionExpired { code: String },

    #[error("participant {participant_id} is not on this session's roster")]
    NotEnrolled { participant_id: String },

    #[error("participant is {distance_m:.0}m from the session, limit {radius_m:.0}m")]
    OutOfRange { distance_m: f64, radius_m: f64 },

    #[error("no verification attempts remaining for this session")]
    RetryExhausted,

    #[error("verification queue is at capacity, retry shortly")]
    QueueFull,

    #[error(transparent)]
    Geofence(#[from] GeofenceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<QueueFull> for EnrollError {
    fn from(_: QueueFull) -> Self {
        EnrollError::QueueFull
    }
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("record API error: {0}")]
    Api(#[from] crate::services::record_api::RecordApiError),
}

/// Returned to the submitting party once a probe has been admitted.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentReceipt {
    pub request_id: String,
    pub session_id: Uuid,
    pub attempt: u32,
}

/// Attendance report assembled from the record API after expiry and
/// delivered to the session owner.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub code: String,
    pub owner_id: String,
    pub label: String,
    pub present: Vec<String>,
    pub absent: Vec<String>,
    pub summary: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ttl: Duration,
    pub report_delay: StdDuration,
    pub geofence_radius_m: f64,
    pub code_attempts: u32,
    pub report_fetch_attempts: u32,
    pub report_fetch_delay: StdDuration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ttl: Duration::seconds(config.session_ttl_secs as i64),
            report_delay: StdDuration::from_secs(config.report_delay_secs),
            geofence_radius_m: config.geofence_radius_m,
            code_attempts: 25,
            report_fetch_attempts: config.submission_retry_attempts,
            report_fetch_delay: StdDuration::from_millis(config.submission_retry_delay_ms),
        }
    }
}

/// Drives sessions from creation through OTP-gated enrollment to expiry and
/// report emission.
///
/// Cloning is cheap (shared handles all the way down); expiry timers and
/// report tasks hold their own clone.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    record_api: Arc<dyn RecordApi>,
    queue: VerificationQueue,
    retries: Arc<RetryTracker>,
    submissions: Arc<SubmissionCoordinator>,
    reports: mpsc::Sender<SessionReport>,
    settings: SessionSettings,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SessionStore>,
        record_api: Arc<dyn RecordApi>,
        queue: VerificationQueue,
        retries: Arc<RetryTracker>,
        submissions: Arc<SubmissionCoordinator>,
        reports: mpsc::Sender<SessionReport>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            store,
            record_api,
            queue,
            retries,
            submissions,
            reports,
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Starts a new session: allocates an OTP code unique among active
    /// sessions and schedules time-driven expiry.
    #[tracing::instrument(skip(self, roster), fields(roster_size = roster.len()))]
    pub async fn create_session(
        &self,
        owner_id: &str,
        label: &str,
        center: Coordinate,
        roster: Vec<RosterEntry>,
    ) -> Result<Session, SessionError> {
        if roster.is_empty() {
            return Err(SessionError::EmptyRoster);
        }

        // Idempotency guard against double-starting the same session.
        let day_start = Utc::now()
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc();
        if self
            .store
            .find_active_for_owner(owner_id, label, day_start)
            .await?
            .is_some()
        {
            return Err(SessionError::DuplicateSession {
                owner_id: owner_id.to_string(),
                label: label.to_string(),
            });
        }

        let now = Utc::now();
        let mut attempts = 0;
        let session = loop {
            attempts += 1;
            if attempts > self.settings.code_attempts {
                return Err(SessionError::CodeExhaustion {
                    attempts: self.settings.code_attempts,
                });
            }

            let code = generate_code();
            if self.store.find_active_by_code(&code).await?.is_some() {
                continue;
            }

            let session = Session {
                id: Uuid::new_v4(),
                code,
                owner_id: owner_id.to_string(),
                label: label.to_string(),
                latitude: center.latitude,
                longitude: center.longitude,
                roster: roster.clone(),
                status: SessionStatus::Active,
                created_at: now,
                expires_at: now + self.settings.ttl,
                report_sent_at: None,
            };

            match self.store.put_session(&session).await {
                Ok(()) => break session,
                // Lost the insert race for this code; roll a new one.
                Err(StoreError::DuplicateCode) => continue,
                Err(e) => return Err(e.into()),
            }
        };

        tracing::info!(
            session_id = %session.id,
            code = %session.code,
            owner_id,
            label,
            expires_at = %session.expires_at,
            "session created"
        );

        self.spawn_expiry_timer(session.id, session.expires_at);
        Ok(session)
    }

    /// Validates an enrollment against OTP, roster, geofence and retry
    /// budget, then admits a verification task. Returns as soon as the task
    /// is queued; the verdict arrives asynchronously.
    pub async fn enroll(
        &self,
        code: &str,
        participant_id: &str,
        location: Coordinate,
        probe: Vec<u8>,
    ) -> Result<EnrollmentReceipt, EnrollError> {
        let session = self
            .store
            .find_active_by_code(code)
            .await?
            .ok_or_else(|| EnrollError::UnknownCode {
                code: code.to_string(),
            })?;

        let now = Utc::now();
        if session.is_expired_at(now) {
            return Err(EnrollError::SessionExpired {
                code: code.to_string(),
            });
        }

        if !session.contains_participant(participant_id) {
            return Err(EnrollError::NotEnrolled {
                participant_id: participant_id.to_string(),
            });
        }

        let center = session.center()?;
        let distance_m = geofence::distance_meters(center, location);
        if distance_m > self.settings.geofence_radius_m {
            return Err(EnrollError::OutOfRange {
                distance_m,
                radius_m: self.settings.geofence_radius_m,
            });
        }

        if !self.retries.can_retry(session.id, participant_id).await {
            return Err(EnrollError::RetryExhausted);
        }
        let attempt = self.retries.attempts(session.id, participant_id).await + 1;

        let request_id = new_request_id();
        let task = VerificationTask {
            request_id: request_id.clone(),
            session_id: session.id,
            code: session.code.clone(),
            owner_id: session.owner_id.clone(),
            label: session.label.clone(),
            participant_id: participant_id.to_string(),
            probe,
            submitted_at: now,
            attempt,
        };
        self.queue.submit(task)?;

        tracing::info!(
            request_id = %request_id,
            session_id = %session.id,
            participant_id,
            attempt,
            distance_m = distance_m as i64,
            "verification task admitted"
        );

        Ok(EnrollmentReceipt {
            request_id,
            session_id: session.id,
            attempt,
        })
    }

    /// Transitions a session to `Expired` exactly once and schedules report
    /// generation after the configured buffer. Safe to call from both the
    /// per-session timer and the sweep backstop.
    pub async fn expire_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let transitioned = self
            .store
            .transition_status(session_id, SessionStatus::Active, SessionStatus::Expired)
            .await?;

        if transitioned {
            tracing::info!(session_id = %session_id, "session expired");
            let manager = self.clone();
            let delay = self.settings.report_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                manager.generate_report(session_id).await;
            });
        }
        Ok(transitioned)
    }

    /// Builds the attendance report from the record API (the authoritative
    /// source, not the local roster) and delivers it to the owner channel.
    pub async fn generate_report(&self, session_id: Uuid) {
        let session = match self.store.find_by_id(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::warn!(session_id = %session_id, "session vanished before report");
                return;
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "report lookup failed");
                return;
            }
        };

        let ctx = SessionContext {
            session_id: session.id,
            code: session.code.clone(),
            owner_id: session.owner_id.clone(),
            label: session.label.clone(),
        };

        let snapshot = {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.record_api.fetch_attendance(&ctx).await {
                    Ok(snapshot) => break snapshot,
                    Err(e) if attempt < self.settings.report_fetch_attempts => {
                        tracing::warn!(
                            session_id = %session_id,
                            attempt,
                            error = %e,
                            "attendance fetch failed, retrying"
                        );
                        tokio::time::sleep(self.settings.report_fetch_delay).await;
                    }
                    Err(e) => {
                        tracing::error!(
                            session_id = %session_id,
                            error = %e,
                            "attendance fetch failed, report not sent"
                        );
                        return;
                    }
                }
            }
        };

        let transitioned = match self
            .store
            .transition_status(session_id, SessionStatus::Expired, SessionStatus::ReportSent)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "report transition failed");
                return;
            }
        };
        if !transitioned {
            tracing::debug!(session_id = %session_id, "report already sent, skipping");
            return;
        }

        // No further writes can land for this session; drop its write flag.
        self.submissions.forget_session(session_id).await;

        let report = build_report(&session, snapshot.present, snapshot.absent);
        tracing::info!(
            session_id = %session_id,
            owner_id = %session.owner_id,
            present = report.present.len(),
            absent = report.absent.len(),
            "attendance report generated"
        );
        if self.reports.send(report).await.is_err() {
            tracing::error!(session_id = %session_id, "report channel closed, report lost");
        }
    }

    /// On-demand report for the most recent session with this code,
    /// assembled from the record API without touching session state.
    pub async fn report_for_code(
        &self,
        code: &str,
    ) -> Result<Option<SessionReport>, ReportError> {
        let Some(session) = self.store.find_latest_by_code(code).await? else {
            return Ok(None);
        };

        let ctx = SessionContext {
            session_id: session.id,
            code: session.code.clone(),
            owner_id: session.owner_id.clone(),
            label: session.label.clone(),
        };
        let snapshot = self.record_api.fetch_attendance(&ctx).await?;
        Ok(Some(build_report(
            &session,
            snapshot.present,
            snapshot.absent,
        )))
    }

    fn spawn_expiry_timer(&self, session_id: Uuid, expires_at: DateTime<Utc>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let wait = (expires_at - Utc::now())
                .to_std()
                .unwrap_or(StdDuration::ZERO);
            tokio::time::sleep(wait).await;
            if let Err(e) = manager.expire_session(session_id).await {
                tracing::error!(session_id = %session_id, error = %e, "timed expiry failed");
            }
        });
    }
}

fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

fn new_request_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn build_report(session: &Session, present: Vec<String>, absent: Vec<String>) -> SessionReport {
    let named = |ids: &[String]| -> Vec<String> {
        ids.iter()
            .map(|id| match session.display_name_for(id) {
                Some(name) => format!("{id} - {name}"),
                None => id.clone(),
            })
            .collect()
    };

    let present = named(&present);
    let absent = named(&absent);
    let summary = format!(
        "Attendance report for {} ({})\nSession code: {}\nTotal: {}\nPresent ({}):\n{}\nAbsent ({}):\n{}",
        session.label,
        session.created_at.format("%Y-%m-%d"),
        session.code,
        present.len() + absent.len(),
        present.len(),
        if present.is_empty() {
            "none".to_string()
        } else {
            present.join("\n")
        },
        absent.len(),
        if absent.is_empty() {
            "none".to_string()
        } else {
            absent.join("\n")
        },
    );

    SessionReport {
        session_id: session.id,
        code: session.code.clone(),
        owner_id: session.owner_id.clone(),
        label: session.label.clone(),
        present,
        absent,
        summary,
        generated_at: Utc::now(),
    }
}
