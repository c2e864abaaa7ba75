use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("no reference image stored for participant {participant_id}")]
    NotFound { participant_id: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("reference store error: {status}")]
    Upstream { status: StatusCode },
}

/// Source of stored reference images, keyed by participant id.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn fetch(&self, participant_id: &str) -> Result<Vec<u8>, ReferenceError>;
}

/// HTTP-backed reference store.
///
/// Reference images were uploaded with varying content types, so lookup
/// probes an ordered set of suffixes before giving up with `NotFound`.
pub struct HttpReferenceStore {
    client: Client,
    base_url: String,
    suffixes: Vec<&'static str>,
    timeout: Duration,
}

impl HttpReferenceStore {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            suffixes: vec![".jpg", ".jpeg", ".png"],
            timeout,
        }
    }
}

#[async_trait]
impl ReferenceStore for HttpReferenceStore {
    async fn fetch(&self, participant_id: &str) -> Result<Vec<u8>, ReferenceError> {
        for suffix in &self.suffixes {
            let url = format!("{}/references/{}{}", self.base_url, participant_id, suffix);
            let response = self
                .client
                .get(&url)
                .timeout(self.timeout)
                .send()
                .await?;

            match response.status() {
                StatusCode::OK => return Ok(response.bytes().await?.to_vec()),
                StatusCode::NOT_FOUND => continue,
                status => return Err(ReferenceError::Upstream { status }),
            }
        }

        Err(ReferenceError::NotFound {
            participant_id: participant_id.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheSlot {
    bytes: Arc<Vec<u8>>,
    stored_at: Instant,
}

struct CacheState {
    entries: HashMap<String, CacheSlot>,
    insertion_order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

/// Short-TTL, size-bounded cache in front of a `ReferenceStore`.
///
/// A retry lands within seconds of the failed attempt, so the second fetch of
/// the same reference is nearly always served from here. Eviction drops the
/// oldest entry once the bound is reached.
pub struct ReferenceCache {
    inner: Arc<dyn ReferenceStore>,
    ttl: Duration,
    max_entries: usize,
    state: Mutex<CacheState>,
}

impl ReferenceCache {
    pub fn new(inner: Arc<dyn ReferenceStore>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner,
            ttl,
            max_entries: max_entries.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub async fn fetch(&self, participant_id: &str) -> Result<Arc<Vec<u8>>, ReferenceError> {
        {
            let mut state = self.state.lock().await;
            if let Some(slot) = state.entries.get(participant_id) {
                if slot.stored_at.elapsed() < self.ttl {
                    let bytes = Arc::clone(&slot.bytes);
                    state.hits += 1;
                    return Ok(bytes);
                }
                state.entries.remove(participant_id);
                state
                    .insertion_order
                    .retain(|key| key.as_str() != participant_id);
            }
            state.misses += 1;
        }

        // Lock is not held across the upstream fetch; concurrent misses for
        // the same key may fetch twice, which is acceptable for a short TTL.
        let bytes = Arc::new(self.inner.fetch(participant_id).await?);

        let mut state = self.state.lock().await;
        while state.entries.len() >= self.max_entries {
            match state.insertion_order.pop_front() {
                Some(oldest) => {
                    state.entries.remove(&oldest);
                }
                None => break,
            }
        }
        if state
            .entries
            .insert(
                participant_id.to_string(),
                CacheSlot {
                    bytes: Arc::clone(&bytes),
                    stored_at: Instant::now(),
                },
            )
            .is_none()
        {
            state.insertion_order.push_back(participant_id.to_string());
        }

        Ok(bytes)
    }

    pub async fn purge_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let ttl = self.ttl;
        let before = state.entries.len();
        state.entries.retain(|_, slot| slot.stored_at.elapsed() < ttl);
        let live: Vec<String> = state.entries.keys().cloned().collect();
        state
            .insertion_order
            .retain(|key| live.iter().any(|k| k == key));
        before - state.entries.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            entries: state.entries.len(),
            max_entries: self.max_entries,
            hits: state.hits,
            misses: state.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ReferenceStore for CountingStore {
        async fn fetch(&self, participant_id: &str) -> Result<Vec<u8>, ReferenceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(participant_id.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn serves_repeat_fetches_from_cache() {
        let inner = Arc::new(CountingStore {
            fetches: AtomicUsize::new(0),
        });
        let cache = ReferenceCache::new(inner.clone(), Duration::from_secs(300), 10);

        let first = cache.fetch("p-1").await.unwrap();
        let second = cache.fetch("p-1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.fetches.load(Ordering::SeqCst), 1);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn evicts_oldest_entry_at_capacity() {
        let inner = Arc::new(CountingStore {
            fetches: AtomicUsize::new(0),
        });
        let cache = ReferenceCache::new(inner.clone(), Duration::from_secs(300), 2);

        cache.fetch("p-1").await.unwrap();
        cache.fetch("p-2").await.unwrap();
        cache.fetch("p-3").await.unwrap();

        // p-1 was evicted; fetching it again goes upstream.
        cache.fetch("p-1").await.unwrap();
        assert_eq!(inner.fetches.load(Ordering::SeqCst), 4);

        // p-3 is still resident.
        cache.fetch("p-3").await.unwrap();
        assert_eq!(inner.fetches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let inner = Arc::new(CountingStore {
            fetches: AtomicUsize::new(0),
        });
        let cache = ReferenceCache::new(inner.clone(), Duration::from_secs(300), 10);

        cache.fetch("p-1").await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        cache.fetch("p-1").await.unwrap();
        assert_eq!(inner.fetches.load(Ordering::SeqCst), 2);
    }
}
