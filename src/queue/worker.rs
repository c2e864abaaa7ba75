use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::timeout;

use crate::services::record_api::SessionContext;
use crate::services::reference_store::ReferenceError;

use super::{QueueInner, VerificationTask, VerificationUpdate};

/// Target pool size from queue depth, mirroring load rather than tracking it
/// worker-per-task: grow in steps when the backlog outruns the pool, shed one
/// worker at a time when the pool idles.
pub fn desired_workers(depth: usize, current: usize, floor: usize, ceiling: usize) -> usize {
    let current = current.clamp(floor.max(1), ceiling.max(1));
    if depth > current * 2 && current < ceiling {
        (current + (depth / 4).max(2)).min(ceiling)
    } else if current > floor && depth < current / 3 {
        current - 1
    } else {
        current
    }
}

pub(crate) fn spawn(inner: Arc<QueueInner>, id: usize) {
    inner.live_workers.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(run(inner, id));
}

/// Periodically recomputes the target pool size and spawns the shortfall.
/// Scale-down is cooperative: workers above the target exit on their own
/// once idle, so in-flight verifications are never cancelled.
pub(crate) async fn supervise(inner: Arc<QueueInner>) {
    let mut tick = tokio::time::interval(inner.config.scale_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let depth = inner.depth.load(Ordering::SeqCst);
        let live = inner.live_workers.load(Ordering::SeqCst);
        let floor = inner.config.min_workers.max(1);
        let ceiling = inner.worker_budget;
        let target = desired_workers(depth, live, floor, ceiling);

        if target != live {
            inner.target_workers.store(target, Ordering::SeqCst);
            tracing::info!(
                depth,
                live_workers = live,
                target_workers = target,
                "rescaling verification worker pool"
            );
        }
        for id in live..target {
            spawn(Arc::clone(&inner), id);
        }
    }
}

async fn run(inner: Arc<QueueInner>, id: usize) {
    tracing::debug!(worker_id = id, "verification worker started");

    loop {
        if inner.shutdown.load(Ordering::SeqCst)
            || id >= inner.target_workers.load(Ordering::SeqCst)
        {
            break;
        }

        // The receiver lock is only held while polling; it is released both
        // on handoff and on idle timeout so exiting workers never wedge the
        // pool.
        let received = {
            let mut rx = inner.rx.lock().await;
            timeout(inner.config.idle_poll, rx.recv()).await
        };

        match received {
            Ok(Some(task)) => {
                inner.depth.fetch_sub(1, Ordering::SeqCst);
                process_task(&inner, task).await;
                inner.total_processed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(None) => break,
            Err(_elapsed) => continue,
        }
    }

    inner.live_workers.fetch_sub(1, Ordering::SeqCst);
    tracing::debug!(worker_id = id, "verification worker exited");
}

async fn process_task(inner: &QueueInner, task: VerificationTask) {
    let ctx = &inner.ctx;
    let request_id = task.request_id.clone();

    tracing::debug!(
        request_id = %request_id,
        session_id = %task.session_id,
        participant_id = %task.participant_id,
        attempt = task.attempt,
        "processing verification task"
    );

    let reference = match ctx.references.fetch(&task.participant_id).await {
        Ok(bytes) => bytes,
        Err(ReferenceError::NotFound { .. }) => {
            tracing::warn!(
                request_id = %request_id,
                participant_id = %task.participant_id,
                "no reference image on file"
            );
            deliver(
                inner,
                VerificationUpdate::Errored {
                    request_id,
                    session_id: task.session_id,
                    participant_id: task.participant_id,
                    reason: "no reference image on file".to_string(),
                },
            );
            return;
        }
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "reference fetch failed");
            deliver(
                inner,
                VerificationUpdate::Errored {
                    request_id,
                    session_id: task.session_id,
                    participant_id: task.participant_id,
                    reason: "reference store unavailable".to_string(),
                },
            );
            return;
        }
    };

    let comparison = ctx
        .comparator
        .compare(&task.probe, &reference, ctx.match_threshold)
        .await;

    // A task admitted just before expiry may complete after it; act on the
    // result only while the session is still active.
    match ctx.store.find_by_id(task.session_id).await {
        Ok(Some(session)) if !session.is_expired_at(Utc::now()) => {}
        Ok(_) => {
            tracing::debug!(
                request_id = %request_id,
                session_id = %task.session_id,
                "discarding verification result for expired session"
            );
            return;
        }
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "session lookup failed");
            deliver(
                inner,
                VerificationUpdate::Errored {
                    request_id,
                    session_id: task.session_id,
                    participant_id: task.participant_id,
                    reason: "session lookup failed".to_string(),
                },
            );
            return;
        }
    }

    match comparison {
        Ok(outcome) if outcome.matched => {
            ctx.retries
                .note_attempt(task.session_id, &task.participant_id, task.attempt)
                .await;

            let session_ctx = SessionContext {
                session_id: task.session_id,
                code: task.code.clone(),
                owner_id: task.owner_id.clone(),
                label: task.label.clone(),
            };
            match ctx
                .submissions
                .submit_attendance(&session_ctx, &task.participant_id)
                .await
            {
                Ok(written) => {
                    tracing::info!(
                        request_id = %request_id,
                        participant_id = %task.participant_id,
                        score = outcome.score,
                        outcome = ?written,
                        "attendance recorded"
                    );
                }
                Err(e) => {
                    // The participant keeps the pass; the write failure is an
                    // owner-side data-quality problem.
                    tracing::warn!(
                        request_id = %request_id,
                        session_id = %task.session_id,
                        owner_id = %task.owner_id,
                        participant_id = %task.participant_id,
                        error = %e,
                        "attendance write failed after verified pass"
                    );
                }
            }

            deliver(
                inner,
                VerificationUpdate::Passed {
                    request_id,
                    session_id: task.session_id,
                    participant_id: task.participant_id,
                    score: outcome.score,
                },
            );
        }
        Ok(outcome) => {
            let attempts_remaining = ctx
                .retries
                .register_failure(task.session_id, &task.participant_id, task.attempt)
                .await;
            tracing::info!(
                request_id = %request_id,
                participant_id = %task.participant_id,
                score = outcome.score,
                attempts_remaining,
                "verification failed"
            );
            deliver(
                inner,
                VerificationUpdate::Failed {
                    request_id,
                    session_id: task.session_id,
                    participant_id: task.participant_id,
                    score: outcome.score,
                    attempts_remaining,
                },
            );
        }
        Err(e) => {
            // Service fault, not a user failure: no retry budget is spent.
            tracing::error!(
                request_id = %request_id,
                participant_id = %task.participant_id,
                error = %e,
                "verification errored"
            );
            deliver(
                inner,
                VerificationUpdate::Errored {
                    request_id,
                    session_id: task.session_id,
                    participant_id: task.participant_id,
                    reason: e.to_string(),
                },
            );
        }
    }
}

/// Exactly-once, non-blocking update delivery. A slow or closed recipient
/// costs the update, never the worker.
fn deliver(inner: &QueueInner, update: VerificationUpdate) {
    use tokio::sync::mpsc::error::TrySendError;

    match inner.ctx.updates.try_send(update) {
        Ok(()) => {}
        Err(TrySendError::Full(update)) => {
            inner.updates_dropped.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(?update, "update channel full, dropping verification update");
        }
        Err(TrySendError::Closed(update)) => {
            inner.updates_dropped.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(?update, "update channel closed, dropping verification update");
        }
    }
}
