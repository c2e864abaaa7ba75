use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::RetryRecord;
use crate::store::SessionStore;

type RetryKey = (Uuid, String);

/// Bounds verification attempts per (session, participant).
///
/// The in-memory registry is the hot path; every change is written through
/// to the store so the budget survives a restart. Only completed
/// verifications consume budget: `QueueFull` rejections and service faults
/// (`VerificationError`) never touch it.
pub struct RetryTracker {
    max_attempts: u32,
    retention: Duration,
    entries: Mutex<HashMap<RetryKey, RetryRecord>>,
    store: Arc<dyn SessionStore>,
}

impl RetryTracker {
    pub fn new(max_attempts: u32, retention: Duration, store: Arc<dyn SessionStore>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retention,
            entries: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Attempts consumed so far; 0 when the participant has never failed.
    pub async fn attempts(&self, session_id: Uuid, participant_id: &str) -> u32 {
        let mut entries = self.entries.lock().await;
        if let Some(record) = entries.get(&(session_id, participant_id.to_string())) {
            return record.attempts;
        }

        // Cold registry after a restart: fall back to the persisted record.
        match self
            .store
            .find_retry_record(session_id, participant_id)
            .await
        {
            Ok(Some(record)) => {
                let attempts = record.attempts;
                entries.insert((session_id, participant_id.to_string()), record);
                attempts
            }
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    participant_id,
                    error = %e,
                    "failed to load persisted retry record"
                );
                0
            }
        }
    }

    pub async fn can_retry(&self, session_id: Uuid, participant_id: &str) -> bool {
        self.attempts(session_id, participant_id).await < self.max_attempts
    }

    /// Records a failed verification attempt and returns the attempts left.
    pub async fn register_failure(
        &self,
        session_id: Uuid,
        participant_id: &str,
        attempt: u32,
    ) -> u32 {
        self.consume(session_id, participant_id, attempt).await
    }

    /// Marks a retry attempt as consumed even though it passed, so a further
    /// enrollment is rejected rather than silently re-verified. First-try
    /// passes create no record.
    pub async fn note_attempt(&self, session_id: Uuid, participant_id: &str, attempt: u32) {
        if attempt > 1 {
            self.consume(session_id, participant_id, attempt).await;
        }
    }

    async fn consume(&self, session_id: Uuid, participant_id: &str, attempt: u32) -> u32 {
        let record = {
            let mut entries = self.entries.lock().await;
            let key = (session_id, participant_id.to_string());
            let record = entries.entry(key).or_insert_with(|| {
                RetryRecord::new(session_id, participant_id.to_string(), Utc::now())
            });
            record.attempts = record.attempts.max(attempt);
            record.clone()
        };

        if let Err(e) = self.store.put_retry_record(&record).await {
            tracing::warn!(
                session_id = %session_id,
                participant_id,
                error = %e,
                "failed to persist retry record"
            );
        }

        self.max_attempts.saturating_sub(record.attempts)
    }

    /// Drops records whose first attempt fell outside the retention window.
    pub async fn purge_stale(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, record| !record.is_stale_at(cutoff));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;

    fn tracker(max_attempts: u32) -> RetryTracker {
        RetryTracker::new(
            max_attempts,
            Duration::hours(1),
            Arc::new(MemorySessionStore::new()),
        )
    }

    #[tokio::test]
    async fn failure_consumes_budget() {
        let tracker = tracker(2);
        let session = Uuid::new_v4();

        assert!(tracker.can_retry(session, "p-1").await);
        let remaining = tracker.register_failure(session, "p-1", 1).await;
        assert_eq!(remaining, 1);
        assert!(tracker.can_retry(session, "p-1").await);

        let remaining = tracker.register_failure(session, "p-1", 2).await;
        assert_eq!(remaining, 0);
        assert!(!tracker.can_retry(session, "p-1").await);
    }

    #[tokio::test]
    async fn passing_retry_still_consumes_the_attempt() {
        let tracker = tracker(2);
        let session = Uuid::new_v4();

        tracker.register_failure(session, "p-1", 1).await;
        // Second attempt passes, but the budget is spent.
        tracker.note_attempt(session, "p-1", 2).await;
        assert!(!tracker.can_retry(session, "p-1").await);
    }

    #[tokio::test]
    async fn first_try_pass_creates_no_record() {
        let tracker = tracker(2);
        let session = Uuid::new_v4();

        tracker.note_attempt(session, "p-1", 1).await;
        assert_eq!(tracker.attempts(session, "p-1").await, 0);
    }

    #[tokio::test]
    async fn budget_is_scoped_per_session() {
        let tracker = tracker(1);
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();

        tracker.register_failure(session_a, "p-1", 1).await;
        assert!(!tracker.can_retry(session_a, "p-1").await);
        assert!(tracker.can_retry(session_b, "p-1").await);
    }

    #[tokio::test]
    async fn stale_records_are_purged() {
        let tracker = tracker(2);
        let session = Uuid::new_v4();
        tracker.register_failure(session, "p-1", 1).await;

        let purged = tracker.purge_stale(Utc::now() + Duration::hours(2)).await;
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn survives_registry_loss_through_the_store() {
        let store: Arc<MemorySessionStore> = Arc::new(MemorySessionStore::new());
        let session = Uuid::new_v4();

        {
            let tracker = RetryTracker::new(2, Duration::hours(1), store.clone());
            tracker.register_failure(session, "p-1", 1).await;
            tracker.register_failure(session, "p-1", 2).await;
        }

        // Fresh tracker, same store: budget still exhausted.
        let tracker = RetryTracker::new(2, Duration::hours(1), store);
        assert!(!tracker.can_retry(session, "p-1").await);
    }
}
