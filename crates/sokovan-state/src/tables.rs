//! redb table definitions for the Sokovan state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{parent_id}:{child_id}` or `{scope}:{id}`.

use redb::TableDefinition;

/// Session rows keyed by `{session_id}`.
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Kernel rows keyed by `{session_id}:{kernel_id}`.
pub const KERNELS: TableDefinition<&str, &[u8]> = TableDefinition::new("kernels");

/// Agent inventory keyed by `{agent_id}`.
pub const AGENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("agents");

/// Resource policies keyed by `{scope}:{id}` (scope: access_key, user, group, domain).
pub const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("policies");

/// Durable occupancy mirror keyed by `{scope}:{id}`.
pub const OCCUPANCY: TableDefinition<&str, &[u8]> = TableDefinition::new("occupancy");

/// Last scheduling failure keyed by `{session_id}`.
pub const FAILURES: TableDefinition<&str, &[u8]> = TableDefinition::new("failures");

/// Phase "work needed" markers keyed by `{phase}`.
pub const MARKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("markers");

/// External fair-share ranks keyed by `{resource_group}:{group_id}/{user_id}`.
pub const RANKS: TableDefinition<&str, &[u8]> = TableDefinition::new("ranks");
