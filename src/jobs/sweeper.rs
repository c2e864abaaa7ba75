use chrono::{Duration, Utc};

use crate::services::reference_store::ReferenceCache;
use crate::services::retry_tracker::RetryTracker;
use crate::services::session_manager::SessionManager;

#[derive(Debug, Default)]
pub struct SweepStats {
    pub expired_sessions: usize,
    pub purged_sessions: u64,
    pub purged_retry_rows: u64,
    pub purged_retry_entries: usize,
    pub purged_cache_entries: usize,
}

/// Fixed-interval sweep over stale state.
///
/// Expires overdue sessions whose timers were lost (for example across a
/// restart), garbage-collects finished sessions past the retention window and
/// purges stale retry state and cache entries.
pub async fn run_sweep(
    manager: &SessionManager,
    retries: &RetryTracker,
    references: &ReferenceCache,
    session_retention: Duration,
    retry_retention: Duration,
) -> Result<SweepStats, crate::store::StoreError> {
    let now = Utc::now();
    let mut stats = SweepStats::default();

    // Backstop for time-driven expiry: the per-session timer normally wins,
    // the CAS transition keeps the two paths from double-firing.
    let due = manager.store().sessions_due_for_expiry(now).await?;
    for session in due {
        match manager.expire_session(session.id).await {
            Ok(true) => stats.expired_sessions += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::error!(
                    session_id = %session.id,
                    error = %e,
                    "sweep failed to expire session"
                );
            }
        }
    }

    stats.purged_sessions = manager
        .store()
        .delete_finished_before(now - session_retention)
        .await?;
    stats.purged_retry_rows = manager
        .store()
        .delete_retry_records_before(now - retry_retention)
        .await?;
    stats.purged_retry_entries = retries.purge_stale(now).await;
    stats.purged_cache_entries = references.purge_expired().await;

    tracing::info!(?stats, "sweep completed");
    Ok(stats)
}
