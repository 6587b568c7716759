//! sokovan-coordinator — phase coordination for the Sokovan scheduler.
//!
//! Phases are wrapped in [`handler::PhaseHandler`]s and driven by
//! [`timer::PhaseTimer`]s on two cadences: a short marker-gated check
//! interval and a long unconditional force interval. Each cycle runs
//! under a named lock ([`lock::FileLockFactory`] across processes,
//! [`lock::LocalLockFactory`] in-process) and ends by cascading
//! markers and broadcasting [`events::SchedulerEvent`]s so downstream
//! phases wake promptly instead of waiting out their interval.

pub mod error;
pub mod events;
pub mod handler;
pub mod lock;
pub mod timer;

pub use error::{CoordinatorError, CoordinatorResult};
pub use events::{EventBus, SchedulerEvent};
pub use handler::{Coordinator, HandlerOutcome, Phase, PhaseHandler};
pub use lock::{FileLockFactory, LocalLockFactory, LockFactory};
pub use timer::{PhaseTimer, TimerConfig};
