//! Lifecycle event broadcast.

use sokovan_state::SessionId;
use tokio::sync::broadcast;

use crate::handler::Phase;

/// Events published after each successful phase cycle. Subscribers
/// that lag simply miss events; the markers in the store remain the
/// source of truth for wakeups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    PhaseCompleted {
        phase: Phase,
        sessions: Vec<SessionId>,
    },
    SessionStuck {
        session_id: SessionId,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget: no subscribers is not an error.
    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
