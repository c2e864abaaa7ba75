use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::rate_limit::RateLimiter;

#[derive(Error, Debug)]
pub enum ComparisonError {
    #[error("comparison service timed out")]
    Timeout,

    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),

    #[error("comparison service error: {status} - {message}")]
    Service { status: StatusCode, message: String },

    #[error("malformed media: {0}")]
    MalformedMedia(String),
}

impl From<reqwest::Error> for ComparisonError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ComparisonError::Timeout
        } else {
            ComparisonError::Http(err)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ComparisonOutcome {
    pub matched: bool,
    pub score: f32,
}

/// Black-box identity comparison: probe media against a stored reference.
#[async_trait]
pub trait FaceComparator: Send + Sync {
    async fn compare(
        &self,
        probe: &[u8],
        reference: &[u8],
        threshold: f32,
    ) -> Result<ComparisonOutcome, ComparisonError>;
}

#[derive(Serialize)]
struct CompareRequest {
    probe: String,
    reference: String,
    threshold: f32,
}

#[derive(Deserialize)]
struct CompareResponse {
    matched: bool,
    score: f32,
}

/// `FaceComparator` backed by an HTTP comparison service.
///
/// Calls go through a sliding-window rate limiter so a burst of queued
/// verifications cannot trip provider throttling.
pub struct HttpFaceComparator {
    client: Client,
    endpoint: Url,
    api_key: Option<Secret<String>>,
    timeout: Duration,
    limiter: RateLimiter,
}

impl HttpFaceComparator {
    pub fn new(
        base_url: &str,
        api_key: Option<Secret<String>>,
        timeout: Duration,
        rate_limit_per_sec: u32,
    ) -> Result<Self, url::ParseError> {
        let endpoint = Url::parse(&format!("{}/compare", base_url.trim_end_matches('/')))?;
        Ok(Self {
            client: Client::new(),
            endpoint,
            api_key,
            timeout,
            limiter: RateLimiter::per_second(rate_limit_per_sec),
        })
    }
}

#[async_trait]
impl FaceComparator for HttpFaceComparator {
    async fn compare(
        &self,
        probe: &[u8],
        reference: &[u8],
        threshold: f32,
    ) -> Result<ComparisonOutcome, ComparisonError> {
        self.limiter.acquire().await;

        let body = CompareRequest {
            probe: BASE64.encode(probe),
            reference: BASE64.encode(reference),
            threshold,
        };

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key.expose_secret().as_str());
        }

        let response = request.send().await?;

        match response.status() {
            StatusCode::OK => {
                let parsed: CompareResponse = response.json().await?;
                Ok(ComparisonOutcome {
                    matched: parsed.matched,
                    score: parsed.score,
                })
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                Err(ComparisonError::MalformedMedia(message))
            }
            other => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                Err(ComparisonError::Service {
                    status: other,
                    message,
                })
            }
        }
    }
}
