// Durable storage for sessions and retry records.
//
// The engine only sees the `SessionStore` trait; `PgSessionStore` is the
// production implementation and `MemorySessionStore` backs tests and
// single-node deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{RetryRecord, Session, SessionStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemorySessionStore;
pub use postgres::PgSessionStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("another active session already uses this code")]
    DuplicateCode,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts or replaces a session record keyed by its id.
    ///
    /// Fails with `DuplicateCode` when another *active* session already holds
    /// the same OTP code.
    async fn put_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>, StoreError>;

    /// The active session for an OTP code, if any. Codes are only unique
    /// among active sessions.
    async fn find_active_by_code(&self, code: &str) -> Result<Option<Session>, StoreError>;

    /// Most recent session for a code regardless of status (report replay).
    async fn find_latest_by_code(&self, code: &str) -> Result<Option<Session>, StoreError>;

    /// Active session started by `owner_id` for `label` at or after `since`.
    /// Backs the double-start idempotency guard.
    async fn find_active_for_owner(
        &self,
        owner_id: &str,
        label: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError>;

    /// Compare-and-set status transition. Returns `false` when the session
    /// was not in `from`, so each transition happens exactly once even when
    /// the timer and the sweep race. Transitioning to `ReportSent` stamps
    /// `report_sent_at`.
    async fn transition_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool, StoreError>;

    /// Active sessions whose TTL has elapsed (sweep backstop for lost timers).
    async fn sessions_due_for_expiry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError>;

    /// Deletes `Expired`/`ReportSent` sessions created before `cutoff`.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn put_retry_record(&self, record: &RetryRecord) -> Result<(), StoreError>;

    async fn find_retry_record(
        &self,
        session_id: Uuid,
        participant_id: &str,
    ) -> Result<Option<RetryRecord>, StoreError>;

    async fn delete_retry_records_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
