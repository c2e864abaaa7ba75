// Models module - Domain entity representations

pub mod retry_record;
pub mod session;

pub use retry_record::RetryRecord;
pub use session::{RosterEntry, Session, SessionStatus};
