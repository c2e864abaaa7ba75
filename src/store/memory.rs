use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{RetryRecord, Session, SessionStatus};

use super::{SessionStore, StoreError};

/// In-memory store used by tests and single-node deployments.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
    retries: RwLock<HashMap<(Uuid, String), RetryRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if session.status == SessionStatus::Active {
            let clash = sessions.values().any(|existing| {
                existing.id != session.id
                    && existing.status == SessionStatus::Active
                    && existing.code == session.code
            });
            if clash {
                return Err(StoreError::DuplicateCode);
            }
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn find_active_by_code(&self, code: &str) -> Result<Option<Session>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .find(|s| s.status == SessionStatus::Active && s.code == code)
            .cloned())
    }

    async fn find_latest_by_code(&self, code: &str) -> Result<Option<Session>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.code == code)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn find_active_for_owner(
        &self,
        owner_id: &str,
        label: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .find(|s| {
                s.status == SessionStatus::Active
                    && s.owner_id == owner_id
                    && s.label == label
                    && s.created_at >= since
            })
            .cloned())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(session) if session.status == from => {
                session.status = to;
                if to == SessionStatus::ReportSent {
                    session.report_sent_at = Some(Utc::now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sessions_due_for_expiry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.expires_at <= now)
            .cloned()
            .collect())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.status == SessionStatus::Active || s.created_at >= cutoff);
        Ok((before - sessions.len()) as u64)
    }

    async fn put_retry_record(&self, record: &RetryRecord) -> Result<(), StoreError> {
        let mut retries = self.retries.write().await;
        retries.insert(
            (record.session_id, record.participant_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn find_retry_record(
        &self,
        session_id: Uuid,
        participant_id: &str,
    ) -> Result<Option<RetryRecord>, StoreError> {
        let retries = self.retries.read().await;
        Ok(retries
            .get(&(session_id, participant_id.to_string()))
            .cloned())
    }

    async fn delete_retry_records_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut retries = self.retries.write().await;
        let before = retries.len();
        retries.retain(|_, record| !record.is_stale_at(cutoff));
        Ok((before - retries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RosterEntry;
    use chrono::Duration;

    fn session(code: &str, status: SessionStatus) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            code: code.to_string(),
            owner_id: "owner-1".to_string(),
            label: "lab".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            roster: vec![RosterEntry {
                participant_id: "p-1".to_string(),
                display_name: "P One".to_string(),
            }],
            status,
            created_at: now,
            expires_at: now + Duration::seconds(120),
            report_sent_at: None,
        }
    }

    #[tokio::test]
    async fn active_codes_are_unique() {
        let store = MemorySessionStore::new();
        store
            .put_session(&session("111111", SessionStatus::Active))
            .await
            .unwrap();

        let clash = store
            .put_session(&session("111111", SessionStatus::Active))
            .await;
        assert!(matches!(clash, Err(StoreError::DuplicateCode)));

        // A finished session may share the code with a later one.
        store
            .put_session(&session("111111", SessionStatus::Expired))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = MemorySessionStore::new();
        let s = session("222222", SessionStatus::Active);
        store.put_session(&s).await.unwrap();

        let first = store
            .transition_status(s.id, SessionStatus::Active, SessionStatus::Expired)
            .await
            .unwrap();
        let second = store
            .transition_status(s.id, SessionStatus::Active, SessionStatus::Expired)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        let sent = store
            .transition_status(s.id, SessionStatus::Expired, SessionStatus::ReportSent)
            .await
            .unwrap();
        assert!(sent);
        let stored = store.find_by_id(s.id).await.unwrap().unwrap();
        assert!(stored.report_sent_at.is_some());
    }

    #[tokio::test]
    async fn retry_records_round_trip_and_purge() {
        let store = MemorySessionStore::new();
        let session_id = Uuid::new_v4();
        let mut record = RetryRecord::new(session_id, "p-1".to_string(), Utc::now());
        record.attempts = 1;
        store.put_retry_record(&record).await.unwrap();

        let found = store
            .find_retry_record(session_id, "p-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.attempts, 1);

        let purged = store
            .delete_retry_records_before(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store
            .find_retry_record(session_id, "p-1")
            .await
            .unwrap()
            .is_none());
    }
}
