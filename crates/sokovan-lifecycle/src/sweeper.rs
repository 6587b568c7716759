//! Pending-queue sweep.

use sokovan_state::{SessionId, SessionStatus, SessionStore};
use std::time::Duration;
use tracing::info;

use crate::epoch_secs;
use crate::error::LifecycleResult;

/// Cancels sessions that sat in the pending queue past the timeout.
/// They never held any allocation, so cancellation is bookkeeping only.
pub struct Sweeper {
    store: SessionStore,
    pending_timeout: Duration,
}

impl Sweeper {
    pub fn new(store: SessionStore, pending_timeout: Duration) -> Self {
        Self {
            store,
            pending_timeout,
        }
    }

    /// Cancel overdue pending sessions. Returns the cancelled ids.
    pub fn sweep(&self) -> LifecycleResult<Vec<SessionId>> {
        let rows = self
            .store
            .list_sessions_by_status(&[SessionStatus::Pending], None)?;
        let now = epoch_secs();
        let overdue: Vec<SessionId> = rows
            .iter()
            .filter(|row| now.saturating_sub(row.created_at) >= self.pending_timeout.as_secs())
            .map(|row| row.workload.id.clone())
            .collect();
        if overdue.is_empty() {
            return Ok(Vec::new());
        }

        let cancelled = self.store.mark_for_termination(&overdue)?;
        info!(count = cancelled.len(), "overdue pending sessions cancelled");
        Ok(cancelled)
    }
}
