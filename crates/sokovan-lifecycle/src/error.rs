//! Lifecycle error types.

use thiserror::Error;

/// Infrastructure failures in the lifecycle handlers. Individual agent
/// RPC failures are captured per call in the phase report instead, so
/// one bad agent never aborts a fan-out.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("state store error: {0}")]
    Store(#[from] sokovan_state::StoreError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
