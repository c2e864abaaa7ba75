// Bounded verification queue with a dynamically sized worker pool.
//
// `submit` admits or rejects immediately; it never waits on verification.
// Workers pull tasks, run the reference-fetch/compare/submit pipeline and
// deliver exactly one update per task over a bounded, non-blocking channel.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::services::comparison::FaceComparator;
use crate::services::reference_store::ReferenceCache;
use crate::services::retry_tracker::RetryTracker;
use crate::services::submission::SubmissionCoordinator;
use crate::store::SessionStore;

pub mod worker;

pub use worker::desired_workers;

/// One accepted identity-proof submission, consumed exactly once by a worker.
#[derive(Debug)]
pub struct VerificationTask {
    pub request_id: String,
    pub session_id: Uuid,
    pub code: String,
    pub owner_id: String,
    pub label: String,
    pub participant_id: String,
    pub probe: Vec<u8>,
    pub submitted_at: DateTime<Utc>,
    pub attempt: u32,
}

/// Terminal result of a verification task, delivered to the message sink.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationUpdate {
    Passed {
        request_id: String,
        session_id: Uuid,
        participant_id: String,
        score: f32,
    },
    Failed {
        request_id: String,
        session_id: Uuid,
        participant_id: String,
        score: f32,
        attempts_remaining: u32,
    },
    Errored {
        request_id: String,
        session_id: Uuid,
        participant_id: String,
        reason: String,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("verification queue is at capacity")]
pub struct QueueFull;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub compute_fraction: f64,
    pub scale_interval: Duration,
    pub idle_poll: Duration,
}

impl QueueConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capacity: config.queue_capacity,
            min_workers: config.queue_min_workers,
            max_workers: config.queue_max_workers,
            compute_fraction: config.compute_fraction,
            scale_interval: Duration::from_secs(1),
            idle_poll: Duration::from_millis(500),
        }
    }

    /// Worker ceiling from host parallelism: a fixed fraction of the cores
    /// is reserved for this pool, two workers per reserved core since the
    /// work is I/O-heavy.
    fn worker_budget(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let reserved = ((cores as f64) * self.compute_fraction).floor().max(1.0) as usize;
        (reserved * 2).clamp(self.min_workers.max(1), self.max_workers.max(1))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub live_workers: usize,
    pub target_workers: usize,
    pub worker_budget: usize,
    pub total_processed: u64,
    pub updates_dropped: u64,
}

/// Collaborators each worker needs to execute a task.
pub struct WorkerContext {
    pub store: Arc<dyn SessionStore>,
    pub comparator: Arc<dyn FaceComparator>,
    pub references: Arc<ReferenceCache>,
    pub submissions: Arc<SubmissionCoordinator>,
    pub retries: Arc<RetryTracker>,
    pub updates: mpsc::Sender<VerificationUpdate>,
    pub match_threshold: f32,
}

pub(crate) struct QueueInner {
    pub(crate) config: QueueConfig,
    pub(crate) ctx: WorkerContext,
    tx: mpsc::Sender<VerificationTask>,
    pub(crate) rx: Mutex<mpsc::Receiver<VerificationTask>>,
    pub(crate) depth: AtomicUsize,
    pub(crate) live_workers: AtomicUsize,
    pub(crate) target_workers: AtomicUsize,
    pub(crate) total_processed: AtomicU64,
    pub(crate) updates_dropped: AtomicU64,
    pub(crate) shutdown: AtomicBool,
    pub(crate) worker_budget: usize,
}

#[derive(Clone)]
pub struct VerificationQueue {
    inner: Arc<QueueInner>,
}

impl VerificationQueue {
    pub fn new(config: QueueConfig, ctx: WorkerContext) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let worker_budget = config.worker_budget();
        let initial = config.min_workers.max(1).min(worker_budget);

        let inner = Arc::new(QueueInner {
            config,
            ctx,
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
            live_workers: AtomicUsize::new(0),
            target_workers: AtomicUsize::new(initial),
            total_processed: AtomicU64::new(0),
            updates_dropped: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            worker_budget,
        });

        for id in 0..initial {
            worker::spawn(Arc::clone(&inner), id);
        }
        tokio::spawn(worker::supervise(Arc::clone(&inner)));

        tracing::info!(
            workers = initial,
            budget = worker_budget,
            capacity = inner.config.capacity,
            "verification queue started"
        );

        Self { inner }
    }

    /// Admits a task or rejects it immediately when the queue is at
    /// capacity. Never blocks on verification progress.
    pub fn submit(&self, task: VerificationTask) -> Result<(), QueueFull> {
        // Counted before the send so a worker can never decrement a task
        // that was not yet accounted for.
        self.inner.depth.fetch_add(1, Ordering::SeqCst);
        match self.inner.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(task)) => {
                self.inner.depth.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(
                    request_id = %task.request_id,
                    participant_id = %task.participant_id,
                    "verification queue full, rejecting submission"
                );
                Err(QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                self.inner.depth.fetch_sub(1, Ordering::SeqCst);
                tracing::error!(
                    request_id = %task.request_id,
                    "verification queue is shut down, rejecting submission"
                );
                Err(QueueFull)
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.inner.depth.load(Ordering::SeqCst),
            capacity: self.inner.config.capacity,
            live_workers: self.inner.live_workers.load(Ordering::SeqCst),
            target_workers: self.inner.target_workers.load(Ordering::SeqCst),
            worker_budget: self.inner.worker_budget,
            total_processed: self.inner.total_processed.load(Ordering::SeqCst),
            updates_dropped: self.inner.updates_dropped.load(Ordering::SeqCst),
        }
    }

    /// Stops supervision and lets workers exit after their in-flight task.
    /// Queued-but-unstarted tasks are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        tracing::info!("verification queue shutting down");
    }
}
