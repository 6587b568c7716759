//! sokovan-lifecycle — session lifecycle execution for the Sokovan
//! scheduler.
//!
//! Scheduled sessions move through the launch pipeline
//! (Preparing/Pulling → Prepared → Creating → Running), terminating
//! ones through teardown (Terminating → Terminated), driven by:
//!
//! - [`launcher::Launcher`] — image pulls and kernel creation, fanned
//!   out per agent,
//! - [`terminator::Terminator`] — destroy fan-out plus the exactly-once
//!   occupancy release,
//! - [`sweeper::Sweeper`] — cancellation of overdue pending sessions,
//! - [`retry::RetryHandler`] — staleness-driven retries with a stuck
//!   ceiling.
//!
//! All agent traffic goes through the [`client::AgentClient`] trait;
//! [`client::MockAgent`] scripts the fleet in tests.

pub mod client;
pub mod error;
pub mod launcher;
pub mod retry;
pub mod sweeper;
pub mod terminator;

pub use client::{
    AgentClient, AgentEndpoint, AgentError, AgentResult, ClusterInfo, ImageRef,
    KernelCreationSpec, MockAgent,
};
pub use error::{LifecycleError, LifecycleResult};
pub use launcher::{Launcher, PhaseReport};
pub use retry::RetryHandler;
pub use sweeper::Sweeper;
pub use terminator::Terminator;

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
