//! Transactional commit of a scheduling pass.

use sokovan_state::{AllocationBatch, SessionAllocation, SessionStore};
use tracing::{debug, info};

use crate::error::ScheduleResult;

/// Commits the batched output of one pass. Successes and failures land
/// in one store transaction: either every session in the batch moves,
/// or none do.
#[derive(Clone)]
pub struct Allocator {
    store: SessionStore,
}

impl Allocator {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    pub fn commit(&self, batch: &AllocationBatch) -> ScheduleResult<Vec<SessionAllocation>> {
        if batch.is_empty() {
            debug!("empty allocation batch, nothing to commit");
            return Ok(Vec::new());
        }
        let committed = self.store.allocate_sessions(batch)?;
        info!(
            scheduled = committed.len(),
            rejected = batch.failures.len(),
            "allocation batch committed"
        );
        Ok(committed)
    }
}
