//! SessionStore — redb-backed repository for the Sokovan scheduler.
//!
//! Provides the snapshot-provider read (`scheduling_data`), the atomic
//! allocation-batch commit (`allocate_sessions`), guarded bulk status
//! transitions, stuck-session bookkeeping, the durable occupancy
//! mirror, and the phase "work needed" markers. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, Table};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::snapshot::{DependencyState, PendingSession, SystemSnapshot};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Everything one scheduling pass needs for one resource group,
/// fetched in a single read transaction.
#[derive(Debug, Clone)]
pub struct SchedulingData {
    /// Pending workloads in arrival order.
    pub workloads: Vec<SessionWorkload>,
    /// Schedulable agents in the resource group.
    pub agents: Vec<AgentInfo>,
    pub snapshot: SystemSnapshot,
}

/// Thread-safe session/agent repository backed by redb.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Database>,
}

impl SessionStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "session store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory session store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        txn.open_table(KERNELS).map_err(map_err!(Table))?;
        txn.open_table(AGENTS).map_err(map_err!(Table))?;
        txn.open_table(POLICIES).map_err(map_err!(Table))?;
        txn.open_table(OCCUPANCY).map_err(map_err!(Table))?;
        txn.open_table(FAILURES).map_err(map_err!(Table))?;
        txn.open_table(MARKERS).map_err(map_err!(Table))?;
        txn.open_table(RANKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Agents ─────────────────────────────────────────────────────

    /// Insert or update an agent's inventory.
    pub fn put_agent(&self, agent: &AgentInfo) -> StoreResult<()> {
        let value = serde_json::to_vec(agent).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(AGENTS).map_err(map_err!(Table))?;
            table
                .insert(agent.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an agent by ID.
    pub fn get_agent(&self, agent_id: &str) -> StoreResult<Option<AgentInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AGENTS).map_err(map_err!(Table))?;
        match table.get(agent_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let agent: AgentInfo =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(agent))
            }
            None => Ok(None),
        }
    }

    /// List agents, optionally filtered by resource group.
    pub fn list_agents(&self, resource_group: Option<&str>) -> StoreResult<Vec<AgentInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AGENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let agent: AgentInfo =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if resource_group.is_none_or(|rg| agent.resource_group == rg) {
                results.push(agent);
            }
        }
        Ok(results)
    }

    // ── Policies & occupancy ───────────────────────────────────────

    /// Insert or update a resource policy for one scope.
    pub fn put_policy(
        &self,
        scope: QuotaScope,
        id: &str,
        policy: &ResourcePolicy,
    ) -> StoreResult<()> {
        let key = scope.key(id);
        let value = serde_json::to_vec(policy).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(POLICIES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a policy by scope and id.
    pub fn get_policy(&self, scope: QuotaScope, id: &str) -> StoreResult<Option<ResourcePolicy>> {
        let key = scope.key(id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POLICIES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let policy: ResourcePolicy =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(policy))
            }
            None => Ok(None),
        }
    }

    /// Read the durable occupancy for one scope entry.
    pub fn occupancy(&self, scope: QuotaScope, id: &str) -> StoreResult<ResourceVector> {
        let key = scope.key(id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OCCUPANCY).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Ok(ResourceVector::new()),
        }
    }

    /// Add to the durable occupancy of one scope entry (bootstrap and
    /// reconciliation use; scheduling goes through `allocate_sessions`).
    pub fn add_occupancy(
        &self,
        scope: QuotaScope,
        id: &str,
        delta: &ResourceVector,
    ) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(OCCUPANCY).map_err(map_err!(Table))?;
            bump_occupancy(&mut table, &scope.key(id), delta, false)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Record an external fair-share rank for `(resource_group, group, user)`.
    pub fn put_fair_share_rank(
        &self,
        resource_group: &str,
        group_id: &str,
        user_id: &str,
        rank: f64,
    ) -> StoreResult<()> {
        let key = format!("{resource_group}:{group_id}/{user_id}");
        let value = serde_json::to_vec(&rank).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RANKS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Sessions & kernels ─────────────────────────────────────────

    /// Accept a new session request: persist a PENDING session row plus
    /// one kernel row per requested container. Returns the session id.
    pub fn enqueue_session(&self, workload: &SessionWorkload) -> StoreResult<SessionId> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            let exists = sessions
                .get(workload.id.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if exists {
                return Err(StoreError::Conflict(format!(
                    "session already exists: {}",
                    workload.id
                )));
            }

            let row = SessionRow {
                workload: workload.clone(),
                status: SessionStatus::Pending,
                result: SessionResult::Unknown,
                created_at: now,
                status_changed_at: now,
                retries: 0,
                stuck: false,
                occupancy_released: false,
                launch: None,
                history: Vec::new(),
            };
            let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            sessions
                .insert(workload.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut kernels = txn.open_table(KERNELS).map_err(map_err!(Table))?;
            for kernel in &workload.kernels {
                let krow = KernelRow {
                    session_id: workload.id.clone(),
                    kernel: kernel.clone(),
                    status: SessionStatus::Pending,
                    agent_id: None,
                    agent_address: None,
                    host_ports: Vec::new(),
                    status_changed_at: now,
                };
                let kvalue = serde_json::to_vec(&krow).map_err(map_err!(Serialize))?;
                kernels
                    .insert(krow.table_key().as_str(), kvalue.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(session_id = %workload.id, kernels = workload.kernels.len(), "session enqueued");
        Ok(workload.id.clone())
    }

    /// Get a session row by id.
    pub fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRow>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        match table.get(session_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let row: SessionRow =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// List sessions currently in any of the given statuses, optionally
    /// filtered by resource group. Ordered by creation time, then id.
    pub fn list_sessions_by_status(
        &self,
        statuses: &[SessionStatus],
        resource_group: Option<&str>,
    ) -> StoreResult<Vec<SessionRow>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: SessionRow =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if statuses.contains(&row.status)
                && resource_group.is_none_or(|rg| row.workload.resource_group == rg)
            {
                results.push(row);
            }
        }
        results.sort_by(|a, b| {
            (a.created_at, &a.workload.id).cmp(&(b.created_at, &b.workload.id))
        });
        Ok(results)
    }

    /// List all kernel rows belonging to a session.
    pub fn kernels_for_session(&self, session_id: &str) -> StoreResult<Vec<KernelRow>> {
        let prefix = format!("{session_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KERNELS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let row: KernelRow =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(row);
            }
        }
        Ok(results)
    }

    /// Set the status of a single kernel.
    pub fn set_kernel_status(
        &self,
        session_id: &str,
        kernel_id: &str,
        status: SessionStatus,
    ) -> StoreResult<()> {
        let key = format!("{session_id}:{kernel_id}");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KERNELS).map_err(map_err!(Table))?;
            let mut row: KernelRow = read_row(&table, &key)?
                .ok_or_else(|| StoreError::NotFound(format!("kernel: {key}")))?;
            row.status = status;
            row.status_changed_at = epoch_secs();
            write_row(&mut table, &key, &row)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Set the status of every kernel belonging to a session.
    pub fn transition_kernels(&self, session_id: &str, to: SessionStatus) -> StoreResult<u32> {
        let prefix = format!("{session_id}:");
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(KERNELS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let k = key.value().to_string();
                if k.starts_with(&prefix) {
                    keys.push(k);
                }
            }
            keys
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KERNELS).map_err(map_err!(Table))?;
            for key in &keys {
                let mut row: KernelRow = read_row(&table, key)?
                    .ok_or_else(|| StoreError::NotFound(format!("kernel: {key}")))?;
                row.status = to;
                row.status_changed_at = epoch_secs();
                write_row(&mut table, key, &row)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(keys.len() as u32)
    }

    /// Guarded bulk status transition: only sessions currently in one
    /// of the `from` statuses move. Returns the ids that transitioned.
    pub fn transition_sessions(
        &self,
        session_ids: &[SessionId],
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> StoreResult<Vec<SessionId>> {
        let now = epoch_secs();
        let mut moved = Vec::new();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            for id in session_ids {
                let Some(mut row) = read_row::<SessionRow>(&table, id)? else {
                    warn!(session_id = %id, "transition target not found");
                    continue;
                };
                if !from.contains(&row.status) {
                    continue;
                }
                row.status = to;
                row.status_changed_at = now;
                write_row(&mut table, id, &row)?;
                moved.push(id.clone());
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(requested = session_ids.len(), moved = moved.len(), ?to, "sessions transitioned");
        Ok(moved)
    }

    /// Record the final result of a session (used by dependency checks).
    pub fn set_session_result(&self, session_id: &str, result: SessionResult) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            let mut row: SessionRow = read_row(&table, session_id)?
                .ok_or_else(|| StoreError::NotFound(format!("session: {session_id}")))?;
            row.result = result;
            write_row(&mut table, session_id, &row)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Persist the creation payload material generated at start time
    /// so later retries re-issue it unchanged.
    pub fn set_launch_info(&self, session_id: &str, launch: &LaunchInfo) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            let mut row: SessionRow = read_row(&table, session_id)?
                .ok_or_else(|| StoreError::NotFound(format!("session: {session_id}")))?;
            row.launch = Some(launch.clone());
            write_row(&mut table, session_id, &row)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Request termination: PENDING sessions are cancelled outright,
    /// any other non-terminal session moves to TERMINATING for the
    /// terminator to fan out destroy calls. Returns affected ids.
    pub fn mark_for_termination(&self, session_ids: &[SessionId]) -> StoreResult<Vec<SessionId>> {
        let now = epoch_secs();
        let mut affected = Vec::new();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            let mut kernels = txn.open_table(KERNELS).map_err(map_err!(Table))?;
            for id in session_ids {
                let Some(mut row) = read_row::<SessionRow>(&sessions, id)? else {
                    continue;
                };
                if row.status.is_terminal() {
                    continue;
                }
                let to = if row.status == SessionStatus::Pending {
                    SessionStatus::Cancelled
                } else {
                    SessionStatus::Terminating
                };
                row.status = to;
                row.status_changed_at = now;
                write_row(&mut sessions, id, &row)?;

                for kernel in &row.workload.kernels {
                    let key = format!("{id}:{}", kernel.id);
                    if let Some(mut krow) = read_row::<KernelRow>(&kernels, &key)? {
                        krow.status = to;
                        krow.status_changed_at = now;
                        write_row(&mut kernels, &key, &krow)?;
                    }
                }
                affected.push(id.clone());
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(affected)
    }

    // ── Retry / stuck bookkeeping ──────────────────────────────────

    /// Increment a session's stuck-phase retry counter. Returns the new count.
    pub fn bump_retries(&self, session_id: &str) -> StoreResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let retries;
        {
            let mut table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            let mut row: SessionRow = read_row(&table, session_id)?
                .ok_or_else(|| StoreError::NotFound(format!("session: {session_id}")))?;
            row.retries += 1;
            // A retry re-arms the staleness clock.
            row.status_changed_at = epoch_secs();
            retries = row.retries;
            write_row(&mut table, session_id, &row)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(retries)
    }

    /// Flag a session as stuck past its retry ceiling. The session
    /// stays in its current phase; retries are suspended until an
    /// operator clears the flag.
    pub fn mark_stuck(&self, session_id: &str) -> StoreResult<()> {
        self.set_stuck(session_id, true)
    }

    /// Operator action: resume retry handling for a stuck session.
    pub fn clear_stuck(&self, session_id: &str) -> StoreResult<()> {
        self.set_stuck(session_id, false)
    }

    fn set_stuck(&self, session_id: &str, stuck: bool) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            let mut row: SessionRow = read_row(&table, session_id)?
                .ok_or_else(|| StoreError::NotFound(format!("session: {session_id}")))?;
            row.stuck = stuck;
            if !stuck {
                row.retries = 0;
                row.status_changed_at = epoch_secs();
            }
            write_row(&mut table, session_id, &row)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Hand occupancy back after termination. Idempotent: the row's
    /// `occupancy_released` flag guards double release. Returns whether
    /// anything was released.
    pub fn release_occupancy(&self, session_id: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            let mut row: SessionRow = read_row(&sessions, session_id)?
                .ok_or_else(|| StoreError::NotFound(format!("session: {session_id}")))?;
            if row.occupancy_released {
                return Ok(false);
            }

            // Sessions cancelled before placement never consumed anything.
            let kernels = txn.open_table(KERNELS).map_err(map_err!(Table))?;
            let mut hosted = Vec::new();
            for kernel in &row.workload.kernels {
                let key = format!("{session_id}:{}", kernel.id);
                let Some(krow) = read_row::<KernelRow>(&kernels, &key)? else {
                    continue;
                };
                if let Some(agent_id) = krow.agent_id {
                    hosted.push((agent_id, kernel.requested.clone()));
                }
            }

            if hosted.is_empty() {
                released = false;
            } else {
                let demand = row.workload.total_demand();
                let mut occupancy = txn.open_table(OCCUPANCY).map_err(map_err!(Table))?;
                for scope in QuotaScope::ALL {
                    let key = scope.key(scope.id_of(&row.workload));
                    bump_occupancy(&mut occupancy, &key, &demand, true)?;
                }

                // Give the slots back to the agents that hosted the kernels.
                let mut agents = txn.open_table(AGENTS).map_err(map_err!(Table))?;
                for (agent_id, requested) in &hosted {
                    if let Some(mut agent) = read_row::<AgentInfo>(&agents, agent_id)? {
                        agent.occupied_slots.subtract(requested);
                        agent.container_count = agent.container_count.saturating_sub(1);
                        write_row(&mut agents, agent_id, &agent)?;
                    }
                }
                released = true;
            }

            row.occupancy_released = true;
            write_row(&mut sessions, session_id, &row)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%session_id, "occupancy released");
        Ok(released)
    }

    // ── Scheduling pass surface ────────────────────────────────────

    /// Fetch everything one pass needs for a resource group in one read:
    /// pending workloads (arrival order), schedulable agents, policies,
    /// occupancy, concurrency counters, pending ceilings input,
    /// dependency states, and fair-share ranks.
    pub fn scheduling_data(&self, resource_group: &str) -> StoreResult<SchedulingData> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;

        // All session rows feed concurrency counts, pending ceilings,
        // and dependency resolution, so read them once.
        let sessions_table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        let mut all_rows: Vec<SessionRow> = Vec::new();
        for entry in sessions_table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: SessionRow =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            all_rows.push(row);
        }

        let mut pending_in_group: Vec<&SessionRow> = all_rows
            .iter()
            .filter(|r| {
                r.status == SessionStatus::Pending && r.workload.resource_group == resource_group
            })
            .collect();
        pending_in_group
            .sort_by(|a, b| (a.created_at, &a.workload.id).cmp(&(b.created_at, &b.workload.id)));
        let workloads: Vec<SessionWorkload> =
            pending_in_group.iter().map(|r| r.workload.clone()).collect();

        let agents_table = txn.open_table(AGENTS).map_err(map_err!(Table))?;
        let mut agents = Vec::new();
        let mut total_capacity = ResourceVector::new();
        for entry in agents_table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let agent: AgentInfo =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if agent.resource_group == resource_group && agent.schedulable {
                total_capacity.add(&agent.available_slots);
                agents.push(agent);
            }
        }

        let policies_table = txn.open_table(POLICIES).map_err(map_err!(Table))?;
        let mut policies = std::collections::HashMap::new();
        for entry in policies_table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let policy: ResourcePolicy =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            policies.insert(key.value().to_string(), policy);
        }

        let occupancy_table = txn.open_table(OCCUPANCY).map_err(map_err!(Table))?;
        let mut occupancy = std::collections::HashMap::new();
        for entry in occupancy_table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let vector: ResourceVector =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            occupancy.insert(key.value().to_string(), vector);
        }

        // Concurrency counters and pending ceilings are credential-wide,
        // not scoped to this resource group.
        let mut concurrency: std::collections::HashMap<AccessKey, SessionCounters> =
            std::collections::HashMap::new();
        let mut pending: std::collections::HashMap<AccessKey, Vec<PendingSession>> =
            std::collections::HashMap::new();
        for row in &all_rows {
            if row.status.is_concurrent() {
                let counters = concurrency.entry(row.workload.access_key.clone()).or_default();
                if row.workload.private_session {
                    counters.sftp += 1;
                } else {
                    counters.active += 1;
                }
            }
            if row.status == SessionStatus::Pending {
                pending
                    .entry(row.workload.access_key.clone())
                    .or_default()
                    .push(PendingSession {
                        id: row.workload.id.clone(),
                        requested: row.workload.total_demand(),
                    });
            }
        }

        let mut dependencies: std::collections::HashMap<SessionId, Vec<DependencyState>> =
            std::collections::HashMap::new();
        for workload in &workloads {
            if workload.depends_on.is_empty() {
                continue;
            }
            let states = workload
                .depends_on
                .iter()
                .map(|dep_id| {
                    all_rows
                        .iter()
                        .find(|r| &r.workload.id == dep_id)
                        .map(|r| DependencyState {
                            id: dep_id.clone(),
                            status: r.status,
                            result: r.result,
                        })
                        // Unknown dependency: treated as unmet.
                        .unwrap_or(DependencyState {
                            id: dep_id.clone(),
                            status: SessionStatus::Pending,
                            result: SessionResult::Unknown,
                        })
                })
                .collect();
            dependencies.insert(workload.id.clone(), states);
        }

        let ranks_table = txn.open_table(RANKS).map_err(map_err!(Table))?;
        let prefix = format!("{resource_group}:");
        let mut fair_share_ranks = std::collections::HashMap::new();
        for entry in ranks_table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if let Some(suffix) = key.value().strip_prefix(&prefix) {
                let rank: f64 =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                fair_share_ranks.insert(suffix.to_string(), rank);
            }
        }

        Ok(SchedulingData {
            workloads,
            agents,
            snapshot: SystemSnapshot {
                resource_group: resource_group.to_string(),
                total_capacity,
                occupancy,
                policies,
                concurrency,
                pending,
                dependencies,
                fair_share_ranks,
            },
        })
    }

    /// Commit one pass's output atomically: successful allocations move
    /// their sessions PENDING → SCHEDULED with agent assignments and bump
    /// the durable occupancy mirror; failures are recorded on the session
    /// history and the failures table. Either the whole batch lands or
    /// nothing does.
    pub fn allocate_sessions(
        &self,
        batch: &AllocationBatch,
    ) -> StoreResult<Vec<SessionAllocation>> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            let mut kernels = txn.open_table(KERNELS).map_err(map_err!(Table))?;
            let mut agents = txn.open_table(AGENTS).map_err(map_err!(Table))?;
            let mut occupancy = txn.open_table(OCCUPANCY).map_err(map_err!(Table))?;
            let mut failures = txn.open_table(FAILURES).map_err(map_err!(Table))?;

            for alloc in &batch.allocations {
                let mut row: SessionRow = read_row(&sessions, &alloc.session_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("session: {}", alloc.session_id)))?;
                if row.status != SessionStatus::Pending {
                    return Err(StoreError::Conflict(format!(
                        "session {} is {:?}, not pending",
                        alloc.session_id, row.status
                    )));
                }

                row.status = SessionStatus::Scheduled;
                row.status_changed_at = now;
                row.history.push(SchedulingAttempt {
                    at: now,
                    scheduled: true,
                    passed: alloc.passed.clone(),
                    failed: alloc.failed.clone(),
                    message: "scheduled".to_string(),
                });

                for kalloc in &alloc.kernels {
                    let key = format!("{}:{}", alloc.session_id, kalloc.kernel_id);
                    let mut krow: KernelRow = read_row(&kernels, &key)?
                        .ok_or_else(|| StoreError::NotFound(format!("kernel: {key}")))?;
                    krow.status = SessionStatus::Scheduled;
                    krow.agent_id = Some(kalloc.agent_id.clone());
                    krow.agent_address = Some(kalloc.agent_address.clone());
                    krow.host_ports = kalloc.host_ports.clone();
                    krow.status_changed_at = now;
                    write_row(&mut kernels, &key, &krow)?;
                }

                for aalloc in &alloc.agents {
                    let mut agent: AgentInfo = read_row(&agents, &aalloc.agent_id)?
                        .ok_or_else(|| StoreError::NotFound(format!("agent: {}", aalloc.agent_id)))?;
                    agent.occupied_slots.add(&aalloc.delta);
                    agent.container_count += aalloc.kernel_count;
                    write_row(&mut agents, &aalloc.agent_id, &agent)?;
                }

                let demand = row.workload.total_demand();
                for scope in QuotaScope::ALL {
                    let key = scope.key(scope.id_of(&row.workload));
                    bump_occupancy(&mut occupancy, &key, &demand, false)?;
                }

                write_row(&mut sessions, &alloc.session_id, &row)?;
                failures
                    .remove(alloc.session_id.as_str())
                    .map_err(map_err!(Write))?;
            }

            for failure in &batch.failures {
                if let Some(mut row) = read_row::<SessionRow>(&sessions, &failure.session_id)? {
                    row.history.push(SchedulingAttempt {
                        at: failure.last_attempt,
                        scheduled: false,
                        passed: failure.passed.clone(),
                        failed: failure.failed.clone(),
                        message: failure.message.clone(),
                    });
                    write_row(&mut sessions, &failure.session_id, &row)?;
                }
                let value = serde_json::to_vec(failure).map_err(map_err!(Serialize))?;
                failures
                    .insert(failure.session_id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            allocations = batch.allocations.len(),
            failures = batch.failures.len(),
            "allocation batch committed"
        );
        Ok(batch.allocations.clone())
    }

    /// The most recent scheduling failure for a session, if any.
    pub fn last_failure(&self, session_id: &str) -> StoreResult<Option<SchedulingFailure>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FAILURES).map_err(map_err!(Table))?;
        match table.get(session_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let failure: SchedulingFailure =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(failure))
            }
            None => Ok(None),
        }
    }

    /// Full predicate trail of every scheduling attempt for a session.
    pub fn scheduling_history(&self, session_id: &str) -> StoreResult<Vec<SchedulingAttempt>> {
        let row = self
            .get_session(session_id)?
            .ok_or_else(|| StoreError::NotFound(format!("session: {session_id}")))?;
        Ok(row.history)
    }

    // ── Phase markers ──────────────────────────────────────────────

    /// Flag that a phase has work waiting. Cheap to read, safe to lose
    /// (the long-interval force run is the correctness backstop).
    pub fn mark_needed(&self, phase: &str) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MARKERS).map_err(map_err!(Table))?;
            table.insert(phase, [1u8].as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Consume a phase marker. Returns whether it was set.
    pub fn load_and_clear(&self, phase: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let was_set;
        {
            let mut table = txn.open_table(MARKERS).map_err(map_err!(Table))?;
            was_set = table.remove(phase).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(was_set)
    }
}

// ── Transaction-local helpers ──────────────────────────────────────

/// Read a JSON row out of an open table within the current transaction.
fn read_row<T: serde::de::DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StoreResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let row = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(row))
        }
        None => Ok(None),
    }
}

/// Write a JSON row into an open table within the current transaction.
fn write_row<T: serde::Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    row: &T,
) -> StoreResult<()> {
    let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
    table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
    Ok(())
}

/// Add or subtract a delta on an occupancy entry in place.
fn bump_occupancy(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    delta: &ResourceVector,
    subtract: bool,
) -> StoreResult<()> {
    let mut current: ResourceVector = read_row(table, key)?.unwrap_or_default();
    if subtract {
        current.subtract(delta);
    } else {
        current.add(delta);
    }
    write_row(table, key, &current)
}

/// Current Unix epoch in seconds.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent(id: &str, cpu: u64, mem: u64) -> AgentInfo {
        AgentInfo {
            id: id.into(),
            address: format!("10.0.0.{}:6001", id.len()),
            architecture: "x86_64".into(),
            resource_group: "sg1".into(),
            available_slots: ResourceVector::from_pairs([("cpu", cpu), ("mem", mem)]),
            occupied_slots: ResourceVector::new(),
            container_count: 0,
            max_containers: 0,
            schedulable: true,
        }
    }

    fn test_workload(id: &str, access_key: &str, cpu: u64, mem: u64) -> SessionWorkload {
        SessionWorkload {
            id: id.into(),
            access_key: access_key.into(),
            user_id: "u1".into(),
            group_id: "g1".into(),
            domain_id: "d1".into(),
            resource_group: "sg1".into(),
            requested: ResourceVector::new(),
            priority: 0,
            kind: SessionKind::Interactive,
            cluster_mode: ClusterMode::SingleNode,
            private_session: false,
            starts_at: None,
            designated_agent: None,
            depends_on: vec![],
            kernels: vec![KernelWorkload {
                id: format!("{id}-k1"),
                image: "python:3.12".into(),
                architecture: "x86_64".into(),
                requested: ResourceVector::from_pairs([("cpu", cpu), ("mem", mem)]),
            }],
        }
    }

    fn test_allocation(workload: &SessionWorkload, agent: &AgentInfo) -> SessionAllocation {
        SessionAllocation {
            session_id: workload.id.clone(),
            kind: workload.kind,
            cluster_mode: workload.cluster_mode,
            resource_group: workload.resource_group.clone(),
            kernels: workload
                .kernels
                .iter()
                .map(|k| KernelAllocation {
                    kernel_id: k.id.clone(),
                    agent_id: agent.id.clone(),
                    agent_address: agent.address.clone(),
                    resource_group: agent.resource_group.clone(),
                    host_ports: vec![],
                })
                .collect(),
            agents: vec![AgentAllocation {
                agent_id: agent.id.clone(),
                delta: workload.total_demand(),
                kernel_count: workload.kernels.len() as u32,
            }],
            passed: vec![SchedulingPredicate::new("concurrency", "ok")],
            failed: vec![],
        }
    }

    #[test]
    fn enqueue_and_get_session() {
        let store = SessionStore::open_in_memory().unwrap();
        let workload = test_workload("s1", "ak1", 2, 2);

        let id = store.enqueue_session(&workload).unwrap();
        assert_eq!(id, "s1");

        let row = store.get_session("s1").unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Pending);
        assert_eq!(row.workload, workload);

        let kernels = store.kernels_for_session("s1").unwrap();
        assert_eq!(kernels.len(), 1);
        assert_eq!(kernels[0].status, SessionStatus::Pending);
        assert!(kernels[0].agent_id.is_none());
    }

    #[test]
    fn enqueue_duplicate_is_conflict() {
        let store = SessionStore::open_in_memory().unwrap();
        let workload = test_workload("s1", "ak1", 1, 1);

        store.enqueue_session(&workload).unwrap();
        let err = store.enqueue_session(&workload).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn allocate_commits_status_occupancy_and_agent() {
        let store = SessionStore::open_in_memory().unwrap();
        let agent = test_agent("a1", 8, 16);
        store.put_agent(&agent).unwrap();

        let workload = test_workload("s1", "ak1", 2, 4);
        store.enqueue_session(&workload).unwrap();

        let batch = AllocationBatch {
            allocations: vec![test_allocation(&workload, &agent)],
            failures: vec![],
        };
        let committed = store.allocate_sessions(&batch).unwrap();
        assert_eq!(committed.len(), 1);

        let row = store.get_session("s1").unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Scheduled);
        assert_eq!(row.history.len(), 1);
        assert!(row.history[0].scheduled);

        let kernels = store.kernels_for_session("s1").unwrap();
        assert_eq!(kernels[0].agent_id.as_deref(), Some("a1"));
        assert_eq!(kernels[0].status, SessionStatus::Scheduled);

        let updated = store.get_agent("a1").unwrap().unwrap();
        assert_eq!(updated.occupied_slots.get("cpu"), 2);
        assert_eq!(updated.container_count, 1);

        let occ = store.occupancy(QuotaScope::AccessKey, "ak1").unwrap();
        assert_eq!(occ.get("cpu"), 2);
        assert_eq!(occ.get("mem"), 4);
        let group_occ = store.occupancy(QuotaScope::Group, "g1").unwrap();
        assert_eq!(group_occ.get("cpu"), 2);
    }

    #[test]
    fn allocate_non_pending_aborts_whole_batch() {
        let store = SessionStore::open_in_memory().unwrap();
        let agent = test_agent("a1", 8, 16);
        store.put_agent(&agent).unwrap();

        let w1 = test_workload("s1", "ak1", 1, 1);
        let w2 = test_workload("s2", "ak1", 1, 1);
        store.enqueue_session(&w1).unwrap();
        store.enqueue_session(&w2).unwrap();
        // s2 is already past pending.
        store
            .transition_sessions(&["s2".into()], &[SessionStatus::Pending], SessionStatus::Cancelled)
            .unwrap();

        let batch = AllocationBatch {
            allocations: vec![test_allocation(&w1, &agent), test_allocation(&w2, &agent)],
            failures: vec![],
        };
        let err = store.allocate_sessions(&batch).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Nothing landed: s1 is still pending, no occupancy recorded.
        let row = store.get_session("s1").unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Pending);
        assert!(store.occupancy(QuotaScope::AccessKey, "ak1").unwrap().is_empty());
        assert_eq!(store.get_agent("a1").unwrap().unwrap().container_count, 0);
    }

    #[test]
    fn failures_land_in_table_and_history() {
        let store = SessionStore::open_in_memory().unwrap();
        let workload = test_workload("s1", "ak1", 1, 1);
        store.enqueue_session(&workload).unwrap();

        let batch = AllocationBatch {
            allocations: vec![],
            failures: vec![SchedulingFailure {
                session_id: "s1".into(),
                passed: vec![],
                failed: vec![SchedulingPredicate::new("quota", "over ceiling")],
                last_attempt: 1000,
                message: "quota: over ceiling".into(),
            }],
        };
        store.allocate_sessions(&batch).unwrap();

        let failure = store.last_failure("s1").unwrap().unwrap();
        assert_eq!(failure.failed[0].name, "quota");

        let history = store.scheduling_history("s1").unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].scheduled);

        // Session stays pending for the next pass.
        let row = store.get_session("s1").unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Pending);
    }

    #[test]
    fn guarded_transition_skips_other_statuses() {
        let store = SessionStore::open_in_memory().unwrap();
        store.enqueue_session(&test_workload("s1", "ak1", 1, 1)).unwrap();
        store.enqueue_session(&test_workload("s2", "ak1", 1, 1)).unwrap();
        store
            .transition_sessions(&["s2".into()], &[SessionStatus::Pending], SessionStatus::Cancelled)
            .unwrap();

        let moved = store
            .transition_sessions(
                &["s1".into(), "s2".into(), "missing".into()],
                &[SessionStatus::Pending],
                SessionStatus::Cancelled,
            )
            .unwrap();
        assert_eq!(moved, vec!["s1".to_string()]);
    }

    #[test]
    fn kernel_transition_is_scoped_to_the_session() {
        let store = SessionStore::open_in_memory().unwrap();
        // "s1" is a textual prefix of "s10"; the composite-key scan
        // must not bleed across the separator.
        store.enqueue_session(&test_workload("s1", "ak1", 1, 1)).unwrap();
        store.enqueue_session(&test_workload("s10", "ak1", 1, 1)).unwrap();

        let moved = store.transition_kernels("s1", SessionStatus::Pulling).unwrap();
        assert_eq!(moved, 1);

        assert_eq!(
            store.kernels_for_session("s1").unwrap()[0].status,
            SessionStatus::Pulling
        );
        assert_eq!(
            store.kernels_for_session("s10").unwrap()[0].status,
            SessionStatus::Pending
        );
    }

    #[test]
    fn launch_info_round_trips() {
        let store = SessionStore::open_in_memory().unwrap();
        store.enqueue_session(&test_workload("s1", "ak1", 1, 1)).unwrap();
        assert!(store.get_session("s1").unwrap().unwrap().launch.is_none());

        let launch = LaunchInfo {
            network_name: "sokovan-net-s1".into(),
            cluster_size: 2,
            ssh_public_key: "pub".into(),
            ssh_private_key: "priv".into(),
            env: std::collections::BTreeMap::from([(
                "SOKOVAN_SESSION_ID".to_string(),
                "s1".to_string(),
            )]),
        };
        store.set_launch_info("s1", &launch).unwrap();

        let row = store.get_session("s1").unwrap().unwrap();
        assert_eq!(row.launch, Some(launch));
    }

    #[test]
    fn retry_and_stuck_bookkeeping() {
        let store = SessionStore::open_in_memory().unwrap();
        store.enqueue_session(&test_workload("s1", "ak1", 1, 1)).unwrap();

        assert_eq!(store.bump_retries("s1").unwrap(), 1);
        assert_eq!(store.bump_retries("s1").unwrap(), 2);

        store.mark_stuck("s1").unwrap();
        assert!(store.get_session("s1").unwrap().unwrap().stuck);

        store.clear_stuck("s1").unwrap();
        let row = store.get_session("s1").unwrap().unwrap();
        assert!(!row.stuck);
        assert_eq!(row.retries, 0);
    }

    #[test]
    fn release_occupancy_is_idempotent() {
        let store = SessionStore::open_in_memory().unwrap();
        let agent = test_agent("a1", 8, 16);
        store.put_agent(&agent).unwrap();

        let workload = test_workload("s1", "ak1", 2, 4);
        store.enqueue_session(&workload).unwrap();
        store
            .allocate_sessions(&AllocationBatch {
                allocations: vec![test_allocation(&workload, &agent)],
                failures: vec![],
            })
            .unwrap();

        assert!(store.release_occupancy("s1").unwrap());
        assert!(!store.release_occupancy("s1").unwrap());

        assert!(store.occupancy(QuotaScope::AccessKey, "ak1").unwrap().is_empty());
        let updated = store.get_agent("a1").unwrap().unwrap();
        assert!(updated.occupied_slots.is_empty());
        assert_eq!(updated.container_count, 0);
    }

    #[test]
    fn mark_for_termination_cancels_pending_terminates_rest() {
        let store = SessionStore::open_in_memory().unwrap();
        store.enqueue_session(&test_workload("s1", "ak1", 1, 1)).unwrap();
        store.enqueue_session(&test_workload("s2", "ak1", 1, 1)).unwrap();
        store
            .transition_sessions(&["s2".into()], &[SessionStatus::Pending], SessionStatus::Running)
            .unwrap();

        let affected = store
            .mark_for_termination(&["s1".into(), "s2".into()])
            .unwrap();
        assert_eq!(affected.len(), 2);

        assert_eq!(
            store.get_session("s1").unwrap().unwrap().status,
            SessionStatus::Cancelled
        );
        assert_eq!(
            store.get_session("s2").unwrap().unwrap().status,
            SessionStatus::Terminating
        );
        // Terminal sessions are untouched by a second call.
        assert!(store.mark_for_termination(&["s1".into()]).unwrap().is_empty());
    }

    #[test]
    fn markers_set_and_clear() {
        let store = SessionStore::open_in_memory().unwrap();

        assert!(!store.load_and_clear("schedule").unwrap());
        store.mark_needed("schedule").unwrap();
        assert!(store.load_and_clear("schedule").unwrap());
        assert!(!store.load_and_clear("schedule").unwrap());
    }

    #[test]
    fn scheduling_data_builds_snapshot() {
        let store = SessionStore::open_in_memory().unwrap();
        store.put_agent(&test_agent("a1", 4, 8)).unwrap();
        store.put_agent(&test_agent("a2", 2, 4)).unwrap();
        let mut other_group = test_agent("a3", 100, 100);
        other_group.resource_group = "sg2".into();
        store.put_agent(&other_group).unwrap();

        // One pending in sg1, one running (counts toward concurrency),
        // one pending dependency target.
        let mut pending = test_workload("s1", "ak1", 2, 2);
        pending.depends_on = vec!["dep1".into()];
        store.enqueue_session(&pending).unwrap();

        store.enqueue_session(&test_workload("dep1", "ak2", 1, 1)).unwrap();
        store
            .transition_sessions(&["dep1".into()], &[SessionStatus::Pending], SessionStatus::Terminated)
            .unwrap();
        store.set_session_result("dep1", SessionResult::Success).unwrap();

        store.enqueue_session(&test_workload("s2", "ak1", 1, 1)).unwrap();
        store
            .transition_sessions(&["s2".into()], &[SessionStatus::Pending], SessionStatus::Running)
            .unwrap();

        store.put_fair_share_rank("sg1", "g1", "u1", 0.25).unwrap();
        store
            .put_policy(QuotaScope::AccessKey, "ak1", &ResourcePolicy::default())
            .unwrap();

        let data = store.scheduling_data("sg1").unwrap();

        assert_eq!(data.workloads.len(), 1);
        assert_eq!(data.workloads[0].id, "s1");
        assert_eq!(data.agents.len(), 2);
        assert_eq!(data.snapshot.total_capacity.get("cpu"), 6);

        assert_eq!(data.snapshot.counters_for("ak1").active, 1);
        assert_eq!(data.snapshot.pending_for("ak1").len(), 1);

        let deps = &data.snapshot.dependencies["s1"];
        assert_eq!(deps.len(), 1);
        assert!(deps[0].is_met());

        assert_eq!(data.snapshot.fair_share_rank("g1", "u1"), Some(0.25));
        assert!(data.snapshot.policy_for(QuotaScope::AccessKey, "ak1").is_some());
    }

    #[test]
    fn arrival_order_is_stable() {
        let store = SessionStore::open_in_memory().unwrap();
        for id in ["s3", "s1", "s2"] {
            store.enqueue_session(&test_workload(id, "ak1", 1, 1)).unwrap();
        }

        // Same created_at second is likely; id breaks ties deterministically.
        let data = store.scheduling_data("sg1").unwrap();
        let ids: Vec<&str> = data.workloads.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn persistent_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sokovan.redb");

        {
            let store = SessionStore::open(&path).unwrap();
            store.enqueue_session(&test_workload("s1", "ak1", 1, 1)).unwrap();
        }

        let store = SessionStore::open(&path).unwrap();
        let row = store.get_session("s1").unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Pending);
    }
}
