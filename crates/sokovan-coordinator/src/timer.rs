//! Dual-interval phase timers.
//!
//! Every phase runs on two cadences: a short check interval that only
//! executes when the phase's needed-marker is set, and a long force
//! interval that executes unconditionally as a safety net against lost
//! markers. Cycle errors are logged and the loop keeps ticking.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::handler::{Coordinator, PhaseHandler};
use crate::lock::LockFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// Marker-gated wakeup cadence.
    pub check_interval: Duration,
    /// Unconditional wakeup cadence.
    pub force_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(2),
            force_interval: Duration::from_secs(30),
        }
    }
}

pub struct PhaseTimer {
    config: TimerConfig,
}

impl PhaseTimer {
    pub fn new(config: TimerConfig) -> Self {
        Self { config }
    }

    /// Drive the handler until shutdown flips. Intended to be spawned.
    pub async fn run<L, H>(
        self,
        coordinator: Arc<Coordinator<L>>,
        handler: H,
        mut shutdown: watch::Receiver<bool>,
    ) where
        L: LockFactory,
        H: PhaseHandler,
    {
        let phase = handler.phase().as_str();
        let mut check = tokio::time::interval(self.config.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut force = tokio::time::interval(self.config.force_interval);
        force.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(phase, "phase timer started");
        loop {
            tokio::select! {
                _ = check.tick() => {
                    if let Err(err) = coordinator.run_cycle(&handler, false).await {
                        warn!(phase, %err, "check cycle failed");
                    }
                }
                _ = force.tick() => {
                    if let Err(err) = coordinator.run_cycle(&handler, true).await {
                        warn!(phase, %err, "forced cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(phase, "phase timer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::handler::{HandlerOutcome, Phase};
    use crate::lock::LocalLockFactory;
    use sokovan_state::SessionStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TickHandler {
        executed: Arc<AtomicUsize>,
    }

    impl PhaseHandler for TickHandler {
        fn phase(&self) -> Phase {
            Phase::Sweep
        }

        fn lock_id(&self) -> String {
            "sweep".to_string()
        }

        async fn execute(&self) -> anyhow::Result<HandlerOutcome> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::default())
        }
    }

    #[tokio::test]
    async fn forced_ticks_execute_and_shutdown_stops_the_loop() {
        let coordinator = Arc::new(Coordinator::new(
            SessionStore::open_in_memory().unwrap(),
            LocalLockFactory::new(),
            EventBus::default(),
        ));
        let executed = Arc::new(AtomicUsize::new(0));
        let handler = TickHandler {
            executed: Arc::clone(&executed),
        };

        let (tx, rx) = watch::channel(false);
        let timer = PhaseTimer::new(TimerConfig {
            check_interval: Duration::from_millis(5),
            force_interval: Duration::from_millis(10),
        });
        let task = tokio::spawn(timer.run(coordinator, handler, rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        // The force interval fires immediately and then keeps ticking.
        assert!(executed.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn marker_wakes_the_check_interval() {
        let store = SessionStore::open_in_memory().unwrap();
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            LocalLockFactory::new(),
            EventBus::default(),
        ));
        let executed = Arc::new(AtomicUsize::new(0));
        let handler = TickHandler {
            executed: Arc::clone(&executed),
        };

        let (tx, rx) = watch::channel(false);
        let timer = PhaseTimer::new(TimerConfig {
            check_interval: Duration::from_millis(5),
            // Far enough out that only the startup tick forces a run.
            force_interval: Duration::from_secs(3600),
        });
        let task = tokio::spawn(timer.run(coordinator, handler, rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_startup = executed.load(Ordering::SeqCst);

        store.mark_needed("sweep").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        assert!(executed.load(Ordering::SeqCst) > after_startup);
    }
}
