//! sokovan-state — embedded state store for the Sokovan scheduler.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for sessions, kernels, agents, resource policies, the
//! durable occupancy mirror, and phase markers.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{session_id}:{kernel_id}`, `{scope}:{id}`) enable
//! efficient prefix scans for related records.
//!
//! The `SessionStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. It is the only writer of durable
//! session/kernel state; scheduling passes read a point-in-time
//! [`SystemSnapshot`](snapshot::SystemSnapshot) and commit through the
//! transactional [`allocate_sessions`](store::SessionStore::allocate_sessions).

pub mod error;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use snapshot::{DependencyState, PendingSession, SystemSnapshot};
pub use store::{SchedulingData, SessionStore};
pub use types::*;
