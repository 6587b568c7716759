//! sokovan-scheduler — the scheduling pipeline for the Sokovan cluster
//! scheduler.
//!
//! A pass runs in four stages over one resource group:
//!
//! - **validators**: admission rules (quota, concurrency, dependencies,
//!   pending ceilings, batch reservations), all recorded by name,
//! - **sequencer**: priority cliff, then FIFO/LIFO/DRF/fair-share
//!   ordering of the contending tier,
//! - **selector**: concentrated/dispersed/round-robin/legacy agent
//!   ranking over pass-scoped trackers,
//! - **allocator**: one atomic store transaction committing successes
//!   and recorded failures together.
//!
//! The [`provisioner::Provisioner`] wires the stages together.

pub mod allocator;
pub mod error;
pub mod provisioner;
pub mod selector;
pub mod sequencer;
pub mod validators;

pub use allocator::Allocator;
pub use error::{ScheduleError, ScheduleResult};
pub use provisioner::{PassSummary, Provisioner};
pub use selector::{
    AgentSelector, AgentTracker, Incompatibility, KernelSelection, SelectionError,
    SelectionStrategy,
};
pub use sequencer::{priority_cliff, Sequencer};
pub use validators::{default_rules, validate_workload, RuleViolation, SchedulingRule};
