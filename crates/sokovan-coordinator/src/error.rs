//! Coordinator error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("state store error: {0}")]
    Store(#[from] sokovan_state::StoreError),

    #[error("lock error: {0}")]
    Lock(String),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
