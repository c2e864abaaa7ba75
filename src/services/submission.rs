use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::record_api::{RecordApi, RecordApiError, RecordWrite, SessionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Created,
    Updated,
    DuplicateOk,
}

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("record API unreachable after {attempts} attempts: {source}")]
    Unreachable {
        attempts: u32,
        source: RecordApiError,
    },
}

#[derive(Debug, Clone, Copy)]
enum WriteOp {
    Create,
    Update,
}

#[derive(Default)]
struct FirstWrite {
    created: bool,
    reserved: bool,
}

/// Serializes the "first write creates, subsequent writes update" protocol
/// per session.
///
/// The per-session flag is reserved inside a short critical section and the
/// network call happens outside it, so one slow record API call never blocks
/// other sessions or other completions of the same session. Losers of the
/// race proceed with an update immediately.
pub struct SubmissionCoordinator {
    record_api: Arc<dyn RecordApi>,
    flags: Mutex<HashMap<Uuid, Arc<Mutex<FirstWrite>>>>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl SubmissionCoordinator {
    pub fn new(record_api: Arc<dyn RecordApi>, retry_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            record_api,
            flags: Mutex::new(HashMap::new()),
            retry_attempts: retry_attempts.max(1),
            retry_delay,
        }
    }

    pub async fn submit_attendance(
        &self,
        ctx: &SessionContext,
        participant_id: &str,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        let slot = self.slot(ctx.session_id).await;

        // Check-and-set under the per-session lock; exactly one completer
        // reserves the create, everyone else updates.
        let op = {
            let mut state = slot.lock().await;
            if state.created || state.reserved {
                WriteOp::Update
            } else {
                state.reserved = true;
                WriteOp::Create
            }
        };

        match op {
            WriteOp::Create => match self.write_with_retry(op, ctx, participant_id).await {
                Ok(write) => {
                    let mut state = slot.lock().await;
                    state.created = true;
                    state.reserved = false;
                    drop(state);
                    Ok(match write {
                        RecordWrite::Created => SubmissionOutcome::Created,
                        RecordWrite::Updated => SubmissionOutcome::Updated,
                        RecordWrite::AlreadyRecorded => SubmissionOutcome::DuplicateOk,
                    })
                }
                Err(e) => {
                    // Release the reservation so a later completion may
                    // attempt the create again.
                    let mut state = slot.lock().await;
                    state.reserved = false;
                    drop(state);
                    Err(e)
                }
            },
            WriteOp::Update => {
                let write = self.write_with_retry(op, ctx, participant_id).await?;
                Ok(match write {
                    RecordWrite::AlreadyRecorded => SubmissionOutcome::DuplicateOk,
                    _ => SubmissionOutcome::Updated,
                })
            }
        }
    }

    /// Drops the per-session flag once the session is finished; late results
    /// are discarded upstream, so the slot is no longer reachable.
    pub async fn forget_session(&self, session_id: Uuid) {
        self.flags.lock().await.remove(&session_id);
    }

    pub async fn tracked_sessions(&self) -> usize {
        self.flags.lock().await.len()
    }

    async fn slot(&self, session_id: Uuid) -> Arc<Mutex<FirstWrite>> {
        let mut flags = self.flags.lock().await;
        Arc::clone(flags.entry(session_id).or_default())
    }

    async fn write_with_retry(
        &self,
        op: WriteOp,
        ctx: &SessionContext,
        participant_id: &str,
    ) -> Result<RecordWrite, SubmissionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match op {
                WriteOp::Create => self.record_api.create_record(ctx, participant_id).await,
                WriteOp::Update => self.record_api.update_record(ctx, participant_id).await,
            };

            match result {
                Ok(write) => return Ok(write),
                Err(e) if attempt < self.retry_attempts && e.is_retryable() => {
                    tracing::warn!(
                        session_id = %ctx.session_id,
                        participant_id,
                        attempt,
                        error = %e,
                        "record API write failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    return Err(SubmissionError::Unreachable {
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }
}
