//! Phase handlers and the cycle coordinator.
//!
//! Each scheduler phase (schedule, launch steps, terminate, retry,
//! sweep) is wrapped in a [`PhaseHandler`]. The [`Coordinator`] runs
//! one cycle of a handler: consult the phase's needed-marker (unless
//! forced), take the phase lock, execute, then cascade markers and
//! broadcast events so downstream phases wake promptly.

use sokovan_state::{SessionId, SessionStore};
use std::future::Future;
use tracing::{debug, error, info};

use crate::error::CoordinatorResult;
use crate::events::{EventBus, SchedulerEvent};
use crate::lock::LockFactory;

/// The scheduler's phases, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Schedule,
    CheckPrecondition,
    CheckPullingProgress,
    Start,
    CheckCreatingProgress,
    Terminate,
    Retry,
    Sweep,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Schedule => "schedule",
            Phase::CheckPrecondition => "check_precondition",
            Phase::CheckPullingProgress => "check_pulling_progress",
            Phase::Start => "start",
            Phase::CheckCreatingProgress => "check_creating_progress",
            Phase::Terminate => "terminate",
            Phase::Retry => "retry",
            Phase::Sweep => "sweep",
        }
    }
}

/// What one handler execution produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// Sessions the cycle moved forward.
    pub sessions: Vec<SessionId>,
    /// Captured per-call errors (already logged by the handler).
    pub errors: Vec<String>,
    /// Markers to set so downstream phases wake on their next check.
    pub cascade: Vec<String>,
}

impl HandlerOutcome {
    pub fn cascade_to(mut self, marker: impl Into<String>) -> Self {
        self.cascade.push(marker.into());
        self
    }
}

/// One schedulable unit of work, driven by a [`crate::timer::PhaseTimer`].
pub trait PhaseHandler: Send + Sync + 'static {
    fn phase(&self) -> Phase;

    /// Lock id for mutual exclusion, e.g. `schedule:sg1`.
    fn lock_id(&self) -> String;

    /// Marker key consulted by check-interval wakeups. By default the
    /// lock id doubles as the marker key.
    fn marker(&self) -> String {
        self.lock_id()
    }

    fn execute(&self) -> impl Future<Output = anyhow::Result<HandlerOutcome>> + Send;
}

/// Runs handler cycles under marker gating and phase locks.
pub struct Coordinator<L: LockFactory> {
    store: SessionStore,
    locks: L,
    events: EventBus,
}

impl<L: LockFactory> Coordinator<L> {
    pub fn new(store: SessionStore, locks: L, events: EventBus) -> Self {
        Self {
            store,
            locks,
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run one cycle. Returns whether the handler executed. Handler
    /// errors are logged and reported as executed cycles; only store
    /// and lock failures escalate.
    pub async fn run_cycle<H: PhaseHandler>(
        &self,
        handler: &H,
        forced: bool,
    ) -> CoordinatorResult<bool> {
        if !forced && !self.store.load_and_clear(&handler.marker())? {
            return Ok(false);
        }
        let Some(_guard) = self.locks.try_acquire(&handler.lock_id())? else {
            debug!(phase = handler.phase().as_str(), "phase lock busy, skipping cycle");
            return Ok(false);
        };

        match handler.execute().await {
            Ok(outcome) => {
                for marker in &outcome.cascade {
                    self.store.mark_needed(marker)?;
                }
                if !outcome.sessions.is_empty() {
                    self.events.publish(SchedulerEvent::PhaseCompleted {
                        phase: handler.phase(),
                        sessions: outcome.sessions.clone(),
                    });
                    info!(
                        phase = handler.phase().as_str(),
                        sessions = outcome.sessions.len(),
                        errors = outcome.errors.len(),
                        "phase cycle completed"
                    );
                }
            }
            Err(err) => {
                // Phase failures are retried on the next tick.
                error!(phase = handler.phase().as_str(), %err, "phase cycle failed");
            }
        }
        Ok(true)
    }
}
