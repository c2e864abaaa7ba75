use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-(session, participant) verification attempt accounting.
///
/// Created on the first failed verification and advanced as further attempts
/// are consumed; purged once `first_attempt_at` falls outside the retry
/// retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub session_id: Uuid,
    pub participant_id: String,
    pub attempts: u32,
    pub first_attempt_at: DateTime<Utc>,
}

impl RetryRecord {
    pub fn new(session_id: Uuid, participant_id: String, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            participant_id,
            attempts: 0,
            first_attempt_at: now,
        }
    }

    pub fn is_stale_at(&self, cutoff: DateTime<Utc>) -> bool {
        self.first_attempt_at < cutoff
    }
}
