use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("no credential available for owner {owner_id}")]
    Missing { owner_id: String },

    #[error("credential refresh failed: {0}")]
    Refresh(String),
}

/// Supplies and refreshes the session owner's bearer token. Token storage
/// and the refresh handshake live outside this crate.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self, owner_id: &str) -> Result<Secret<String>, CredentialError>;

    /// Called after an authentication failure; returns a fresh token.
    async fn refresh_token(&self, owner_id: &str) -> Result<Secret<String>, CredentialError>;
}

/// Single shared token from configuration; refresh hands back the same value.
pub struct StaticTokenProvider {
    token: Secret<String>,
}

impl StaticTokenProvider {
    pub fn new(token: Secret<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn bearer_token(&self, _owner_id: &str) -> Result<Secret<String>, CredentialError> {
        Ok(self.token.clone())
    }

    async fn refresh_token(&self, _owner_id: &str) -> Result<Secret<String>, CredentialError> {
        Ok(self.token.clone())
    }
}

/// Session identity attached to every record API call.
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub code: String,
    pub owner_id: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordWrite {
    Created,
    Updated,
    /// The API reported the participant as already recorded; success from
    /// the caller's perspective.
    AlreadyRecorded,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AttendanceSnapshot {
    pub present: Vec<String>,
    pub absent: Vec<String>,
}

#[derive(Error, Debug)]
pub enum RecordApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("record API error: {status} - {message}")]
    Api { status: StatusCode, message: String },

    #[error("authentication failed after token refresh")]
    AuthFailed,

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
}

impl RecordApiError {
    /// Transport faults and upstream 5xx are worth retrying; rejected
    /// payloads and auth failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            RecordApiError::Http(_) => true,
            RecordApiError::Api { status, .. } => status.is_server_error(),
            RecordApiError::AuthFailed | RecordApiError::Credential(_) => false,
        }
    }
}

/// External, non-transactional attendance record API.
#[async_trait]
pub trait RecordApi: Send + Sync {
    async fn create_record(
        &self,
        ctx: &SessionContext,
        participant_id: &str,
    ) -> Result<RecordWrite, RecordApiError>;

    async fn update_record(
        &self,
        ctx: &SessionContext,
        participant_id: &str,
    ) -> Result<RecordWrite, RecordApiError>;

    /// Authoritative attendance for the session, used for report assembly.
    async fn fetch_attendance(
        &self,
        ctx: &SessionContext,
    ) -> Result<AttendanceSnapshot, RecordApiError>;

    async fn ping(&self) -> Result<(), RecordApiError>;
}

#[derive(Serialize)]
struct AttendancePayload<'a> {
    session_id: Uuid,
    code: &'a str,
    label: &'a str,
    participant_id: &'a str,
    recorded_at: DateTime<Utc>,
}

/// Whether a rejection actually means "already recorded".
///
/// The upstream mostly answers 409 for duplicates, but some deployments
/// misuse 400 with a duplicate marker in the body. A 403 is a genuine
/// authorization fault and is never treated as success.
fn is_duplicate_response(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::CONFLICT {
        return true;
    }
    if status == StatusCode::BAD_REQUEST {
        let body = body.to_ascii_lowercase();
        return body.contains("already") || body.contains("duplicate");
    }
    false
}

/// HTTP client for the record API.
pub struct RecordApiClient {
    client: Client,
    base_url: String,
    credentials: std::sync::Arc<dyn CredentialProvider>,
    timeout: Duration,
}

impl RecordApiClient {
    pub fn new(
        base_url: &str,
        credentials: std::sync::Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            timeout,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Sends `build()` with the current bearer token; on 401 refreshes the
    /// token once and retries before giving up with `AuthFailed`.
    async fn send_authorized<F>(
        &self,
        owner_id: &str,
        build: F,
    ) -> Result<reqwest::Response, RecordApiError>
    where
        F: Fn(&Client) -> reqwest::RequestBuilder,
    {
        let token = self.credentials.bearer_token(owner_id).await?;
        let response = build(&self.client)
            .timeout(self.timeout)
            .bearer_auth(token.expose_secret())
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::info!(owner_id, "record API token rejected, refreshing once");
        let token = self.credentials.refresh_token(owner_id).await?;
        let response = build(&self.client)
            .timeout(self.timeout)
            .bearer_auth(token.expose_secret())
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(RecordApiError::AuthFailed);
        }
        Ok(response)
    }

    async fn classify_write(
        response: reqwest::Response,
        outcome: RecordWrite,
    ) -> Result<RecordWrite, RecordApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(outcome);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        if is_duplicate_response(status, &body) {
            return Ok(RecordWrite::AlreadyRecorded);
        }
        Err(RecordApiError::Api {
            status,
            message: body,
        })
    }
}

#[async_trait]
impl RecordApi for RecordApiClient {
    async fn create_record(
        &self,
        ctx: &SessionContext,
        participant_id: &str,
    ) -> Result<RecordWrite, RecordApiError> {
        let url = self.endpoint("attendance");
        let payload = AttendancePayload {
            session_id: ctx.session_id,
            code: &ctx.code,
            label: &ctx.label,
            participant_id,
            recorded_at: Utc::now(),
        };

        let response = self
            .send_authorized(&ctx.owner_id, |client| {
                client.post(&url).json(&payload)
            })
            .await?;

        Self::classify_write(response, RecordWrite::Created).await
    }

    async fn update_record(
        &self,
        ctx: &SessionContext,
        participant_id: &str,
    ) -> Result<RecordWrite, RecordApiError> {
        let url = self.endpoint("attendance");
        let payload = AttendancePayload {
            session_id: ctx.session_id,
            code: &ctx.code,
            label: &ctx.label,
            participant_id,
            recorded_at: Utc::now(),
        };

        let response = self
            .send_authorized(&ctx.owner_id, |client| {
                client.put(&url).json(&payload)
            })
            .await?;

        Self::classify_write(response, RecordWrite::Updated).await
    }

    async fn fetch_attendance(
        &self,
        ctx: &SessionContext,
    ) -> Result<AttendanceSnapshot, RecordApiError> {
        let url = self.endpoint("attendance");
        let response = self
            .send_authorized(&ctx.owner_id, |client| {
                client.get(&url).query(&[
                    ("session_id", ctx.session_id.to_string()),
                    ("label", ctx.label.clone()),
                ])
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RecordApiError::Api { status, message });
        }

        Ok(response.json().await?)
    }

    async fn ping(&self) -> Result<(), RecordApiError> {
        let url = self.endpoint("health");
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RecordApiError::Api {
                status,
                message: "health probe failed".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_a_duplicate() {
        assert!(is_duplicate_response(StatusCode::CONFLICT, ""));
    }

    #[test]
    fn bad_request_needs_a_duplicate_marker() {
        assert!(is_duplicate_response(
            StatusCode::BAD_REQUEST,
            r#"{"error":"participant already marked"}"#
        ));
        assert!(!is_duplicate_response(
            StatusCode::BAD_REQUEST,
            r#"{"error":"missing field"}"#
        ));
    }

    #[test]
    fn forbidden_is_never_a_duplicate() {
        assert!(!is_duplicate_response(
            StatusCode::FORBIDDEN,
            r#"{"error":"already marked"}"#
        ));
    }
}
