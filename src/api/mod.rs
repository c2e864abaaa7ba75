// API module - HTTP surface over the coordination engine

use std::sync::Arc;

use crate::config::Config;
use crate::queue::VerificationQueue;
use crate::services::record_api::RecordApi;
use crate::services::reference_store::ReferenceCache;
use crate::services::session_manager::SessionManager;
use crate::services::submission::SubmissionCoordinator;

pub mod health;
pub mod monitor;
pub mod sessions;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub queue: VerificationQueue,
    pub references: Arc<ReferenceCache>,
    pub submissions: Arc<SubmissionCoordinator>,
    pub record_api: Arc<dyn RecordApi>,
    pub config: Config,
}
