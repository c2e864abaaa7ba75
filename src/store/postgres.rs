use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, FromRow, PgPool};
use uuid::Uuid;

use crate::models::{RetryRecord, RosterEntry, Session, SessionStatus};

use super::{SessionStore, StoreError};

/// Postgres-backed session store.
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct SessionRow {
    id: Uuid,
    code: String,
    owner_id: String,
    label: String,
    latitude: f64,
    longitude: f64,
    roster: Json<Vec<RosterEntry>>,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    report_sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status = SessionStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Database(sqlx::Error::Decode(
                format!("unknown session status '{}'", row.status).into(),
            )))?;
        Ok(Session {
            id: row.id,
            code: row.code,
            owner_id: row.owner_id,
            label: row.label,
            latitude: row.latitude,
            longitude: row.longitude,
            roster: row.roster.0,
            status,
            created_at: row.created_at,
            expires_at: row.expires_at,
            report_sent_at: row.report_sent_at,
        })
    }
}

#[derive(FromRow)]
struct RetryRow {
    session_id: Uuid,
    participant_id: String,
    attempts: i32,
    first_attempt_at: DateTime<Utc>,
}

impl From<RetryRow> for RetryRecord {
    fn from(row: RetryRow) -> Self {
        RetryRecord {
            session_id: row.session_id,
            participant_id: row.participant_id,
            attempts: row.attempts.max(0) as u32,
            first_attempt_at: row.first_attempt_at,
        }
    }
}

fn map_unique_violation(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.constraint() == Some("sessions_active_code_idx") {
            return StoreError::DuplicateCode;
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, code, owner_id, label, latitude, longitude,
                roster, status, created_at, expires_at, report_sent_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                expires_at = EXCLUDED.expires_at,
                report_sent_at = EXCLUDED.report_sent_at
            "#,
        )
        .bind(session.id)
        .bind(&session.code)
        .bind(&session.owner_id)
        .bind(&session.label)
        .bind(session.latitude)
        .bind(session.longitude)
        .bind(Json(&session.roster))
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.report_sent_at)
        .execute(&self.pool)
        .await
        .map_err(map_unique_violation)?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM sessions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Session::try_from).transpose()
    }

    async fn find_active_by_code(&self, code: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM sessions
            WHERE code = $1 AND status = 'active'
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Session::try_from).transpose()
    }

    async fn find_latest_by_code(&self, code: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM sessions
            WHERE code = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Session::try_from).transpose()
    }

    async fn find_active_for_owner(
        &self,
        owner_id: &str,
        label: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM sessions
            WHERE owner_id = $1 AND label = $2
              AND status = 'active' AND created_at >= $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(owner_id)
        .bind(label)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Session::try_from).transpose()
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = $3,
                report_sent_at = CASE WHEN $3 = 'report_sent' THEN now()
                                      ELSE report_sent_at END
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn sessions_due_for_expiry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM sessions
            WHERE status = 'active' AND expires_at <= $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Session::try_from).collect()
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sessions
            WHERE created_at < $1 AND status IN ('expired', 'report_sent')
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn put_retry_record(&self, record: &RetryRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO retry_records (session_id, participant_id, attempts, first_attempt_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id, participant_id)
            DO UPDATE SET attempts = EXCLUDED.attempts
            "#,
        )
        .bind(record.session_id)
        .bind(&record.participant_id)
        .bind(record.attempts as i32)
        .bind(record.first_attempt_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_retry_record(
        &self,
        session_id: Uuid,
        participant_id: &str,
    ) -> Result<Option<RetryRecord>, StoreError> {
        let row = sqlx::query_as::<_, RetryRow>(
            r#"
            SELECT * FROM retry_records
            WHERE session_id = $1 AND participant_id = $2
            "#,
        )
        .bind(session_id)
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RetryRecord::from))
    }

    async fn delete_retry_records_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM retry_records WHERE first_attempt_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
