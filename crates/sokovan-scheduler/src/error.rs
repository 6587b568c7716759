//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during scheduling operations.
///
/// Per-workload rejections (quota, concurrency, no compatible agent)
/// are not errors: they are recorded as predicates and the pass moves
/// on. Only infrastructure failures escalate through this type.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("state store error: {0}")]
    Store(#[from] sokovan_state::StoreError),
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;
