// Shared test harness: the engine wired against in-memory and scripted
// collaborators. No network, no database.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tokio::sync::{mpsc, Mutex, Semaphore};

use rollcall::models::RosterEntry;
use rollcall::queue::{QueueConfig, VerificationQueue, VerificationUpdate, WorkerContext};
use rollcall::services::comparison::{ComparisonError, ComparisonOutcome, FaceComparator};
use rollcall::services::geofence::Coordinate;
use rollcall::services::record_api::{
    AttendanceSnapshot, RecordApi, RecordApiError, RecordWrite, SessionContext,
};
use rollcall::services::reference_store::{ReferenceCache, ReferenceError, ReferenceStore};
use rollcall::services::retry_tracker::RetryTracker;
use rollcall::services::session_manager::{
    SessionManager, SessionReport, SessionSettings,
};
use rollcall::services::submission::SubmissionCoordinator;
use rollcall::store::{MemorySessionStore, SessionStore};

#[derive(Debug, Clone)]
pub enum Verdict {
    Match(f32),
    NoMatch(f32),
    Fault(String),
}

/// Comparator that replays a scripted sequence of verdicts, optionally
/// parking each call on a semaphore so tests can hold workers mid-task.
pub struct ScriptedComparator {
    script: Mutex<VecDeque<Verdict>>,
    default: Verdict,
    gate: Option<Arc<Semaphore>>,
    pub calls: AtomicUsize,
}

impl ScriptedComparator {
    pub fn new(script: Vec<Verdict>, default: Verdict, gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default,
            gate,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceComparator for ScriptedComparator {
    async fn compare(
        &self,
        _probe: &[u8],
        _reference: &[u8],
        _threshold: f32,
    ) -> Result<ComparisonOutcome, ComparisonError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        let verdict = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        match verdict {
            Verdict::Match(score) => Ok(ComparisonOutcome {
                matched: true,
                score,
            }),
            Verdict::NoMatch(score) => Ok(ComparisonOutcome {
                matched: false,
                score,
            }),
            Verdict::Fault(reason) => Err(ComparisonError::MalformedMedia(reason)),
        }
    }
}

/// Reference store that fabricates bytes for every participant except the
/// ones listed as missing.
pub struct FakeReferenceStore {
    pub missing: Vec<String>,
}

#[async_trait]
impl ReferenceStore for FakeReferenceStore {
    async fn fetch(&self, participant_id: &str) -> Result<Vec<u8>, ReferenceError> {
        if self.missing.iter().any(|id| id == participant_id) {
            return Err(ReferenceError::NotFound {
                participant_id: participant_id.to_string(),
            });
        }
        Ok(format!("reference-{participant_id}").into_bytes())
    }
}

/// Record API double with call counters and programmable failures.
#[derive(Default)]
pub struct MockRecordApi {
    pub create_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub create_delay: Duration,
    /// First N create calls fail with the given status.
    pub failing_creates: AtomicUsize,
    pub failure_status: u16,
    pub duplicate_on_create: AtomicBool,
    pub recorded: Mutex<Vec<String>>,
    pub absent: Mutex<Vec<String>>,
}

impl MockRecordApi {
    pub fn new() -> Self {
        Self {
            failure_status: 500,
            ..Self::default()
        }
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub async fn recorded(&self) -> Vec<String> {
        self.recorded.lock().await.clone()
    }

    fn failure(&self) -> RecordApiError {
        RecordApiError::Api {
            status: reqwest::StatusCode::from_u16(self.failure_status)
                .unwrap_or(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            message: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl RecordApi for MockRecordApi {
    async fn create_record(
        &self,
        _ctx: &SessionContext,
        participant_id: &str,
    ) -> Result<RecordWrite, RecordApiError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(self.failure());
        }
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        self.recorded.lock().await.push(participant_id.to_string());
        if self.duplicate_on_create.load(Ordering::SeqCst) {
            return Ok(RecordWrite::AlreadyRecorded);
        }
        Ok(RecordWrite::Created)
    }

    async fn update_record(
        &self,
        _ctx: &SessionContext,
        participant_id: &str,
    ) -> Result<RecordWrite, RecordApiError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.recorded.lock().await.push(participant_id.to_string());
        Ok(RecordWrite::Updated)
    }

    async fn fetch_attendance(
        &self,
        _ctx: &SessionContext,
    ) -> Result<AttendanceSnapshot, RecordApiError> {
        Ok(AttendanceSnapshot {
            present: self.recorded.lock().await.clone(),
            absent: self.absent.lock().await.clone(),
        })
    }

    async fn ping(&self) -> Result<(), RecordApiError> {
        Ok(())
    }
}

pub struct HarnessOptions {
    pub ttl: ChronoDuration,
    pub report_delay: Duration,
    pub radius_m: f64,
    pub max_attempts: u32,
    pub queue_capacity: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub script: Vec<Verdict>,
    pub default_verdict: Verdict,
    pub gate: Option<Arc<Semaphore>>,
    pub missing_references: Vec<String>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            ttl: ChronoDuration::seconds(120),
            report_delay: Duration::ZERO,
            radius_m: 50.0,
            max_attempts: 2,
            queue_capacity: 64,
            min_workers: 2,
            max_workers: 2,
            script: Vec::new(),
            default_verdict: Verdict::Match(92.0),
            gate: None,
            missing_references: Vec::new(),
        }
    }
}

pub struct Harness {
    pub store: Arc<MemorySessionStore>,
    pub comparator: Arc<ScriptedComparator>,
    pub record_api: Arc<MockRecordApi>,
    pub references: Arc<ReferenceCache>,
    pub retries: Arc<RetryTracker>,
    pub submissions: Arc<SubmissionCoordinator>,
    pub queue: VerificationQueue,
    pub manager: Arc<SessionManager>,
    pub updates: mpsc::Receiver<VerificationUpdate>,
    pub reports: mpsc::Receiver<SessionReport>,
}

pub fn build_harness(opts: HarnessOptions) -> Harness {
    let store = Arc::new(MemorySessionStore::new());
    let store_dyn: Arc<dyn SessionStore> = store.clone();

    let comparator = Arc::new(ScriptedComparator::new(
        opts.script,
        opts.default_verdict,
        opts.gate,
    ));
    let record_api = Arc::new(MockRecordApi::new());
    let references = Arc::new(ReferenceCache::new(
        Arc::new(FakeReferenceStore {
            missing: opts.missing_references,
        }),
        Duration::from_secs(300),
        100,
    ));
    let retries = Arc::new(RetryTracker::new(
        opts.max_attempts,
        ChronoDuration::hours(1),
        store_dyn.clone(),
    ));
    let submissions = Arc::new(SubmissionCoordinator::new(
        record_api.clone(),
        2,
        Duration::from_millis(10),
    ));

    let (updates_tx, updates_rx) = mpsc::channel(256);
    let queue = VerificationQueue::new(
        QueueConfig {
            capacity: opts.queue_capacity,
            min_workers: opts.min_workers,
            max_workers: opts.max_workers,
            compute_fraction: 1.0,
            scale_interval: Duration::from_millis(100),
            idle_poll: Duration::from_millis(50),
        },
        WorkerContext {
            store: store_dyn.clone(),
            comparator: comparator.clone(),
            references: references.clone(),
            submissions: submissions.clone(),
            retries: retries.clone(),
            updates: updates_tx,
            match_threshold: 50.0,
        },
    );

    let (reports_tx, reports_rx) = mpsc::channel(16);
    let manager = Arc::new(SessionManager::new(
        store_dyn,
        record_api.clone(),
        queue.clone(),
        retries.clone(),
        submissions.clone(),
        reports_tx,
        SessionSettings {
            ttl: opts.ttl,
            report_delay: opts.report_delay,
            geofence_radius_m: opts.radius_m,
            code_attempts: 25,
            report_fetch_attempts: 3,
            report_fetch_delay: Duration::from_millis(20),
        },
    ));

    Harness {
        store,
        comparator,
        record_api,
        references,
        retries,
        submissions,
        queue,
        manager,
        updates: updates_rx,
        reports: reports_rx,
    }
}

pub fn roster(ids: &[&str]) -> Vec<RosterEntry> {
    ids.iter()
        .map(|id| RosterEntry {
            participant_id: id.to_string(),
            display_name: format!("{id}-name"),
        })
        .collect()
}

pub fn center() -> Coordinate {
    Coordinate::new(16.5062, 80.6480).expect("valid coordinate")
}

/// Roughly 5 meters north of the session center.
pub fn near_center() -> Coordinate {
    Coordinate::new(16.50624, 80.6480).expect("valid coordinate")
}

/// Roughly 75 meters north of the session center.
pub fn far_from_center() -> Coordinate {
    Coordinate::new(16.506875, 80.6480).expect("valid coordinate")
}

pub fn probe() -> Vec<u8> {
    b"probe-media".to_vec()
}

/// Next update, or a panic after two seconds.
pub async fn recv_update(rx: &mut mpsc::Receiver<VerificationUpdate>) -> VerificationUpdate {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for verification update")
        .expect("update channel closed")
}

/// Polls until `predicate` holds or two seconds elapse.
pub async fn wait_until<F>(mut predicate: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within two seconds");
}
