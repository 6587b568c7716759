//! Domain types for the Sokovan state store.
//!
//! These types represent pending session workloads, agent inventory,
//! resource policies, and the committed outputs of a scheduling pass.
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a session.
pub type SessionId = String;

/// Unique identifier for a kernel (one container within a session).
pub type KernelId = String;

/// Unique identifier for an agent in the fleet.
pub type AgentId = String;

/// Unique identifier for a credential (access key).
pub type AccessKey = String;

// ── Resource vectors ───────────────────────────────────────────────

/// A multi-dimensional resource quantity keyed by slot name
/// (`cpu`, `mem`, `cuda.device`, ...). Missing slots read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVector(BTreeMap<String, u64>);

impl ResourceVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(slot, amount)` pairs. Zero amounts are dropped.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let mut v = Self::new();
        for (slot, amount) in pairs {
            v.set(slot.into(), amount);
        }
        v
    }

    pub fn get(&self, slot: &str) -> u64 {
        self.0.get(slot).copied().unwrap_or(0)
    }

    pub fn set(&mut self, slot: String, amount: u64) {
        if amount == 0 {
            self.0.remove(&slot);
        } else {
            self.0.insert(slot, amount);
        }
    }

    /// True if every slot is zero.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&v| v == 0)
    }

    /// Iterate over `(slot, amount)` entries.
    pub fn slots(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// Add every slot of `other` to this vector.
    pub fn add(&mut self, other: &ResourceVector) {
        for (slot, amount) in other.slots() {
            let current = self.get(slot);
            self.set(slot.to_string(), current + amount);
        }
    }

    /// Subtract every slot of `other`, saturating at zero.
    pub fn subtract(&mut self, other: &ResourceVector) {
        for (slot, amount) in other.slots() {
            let current = self.get(slot);
            self.set(slot.to_string(), current.saturating_sub(amount));
        }
    }

    /// True if this vector can satisfy `demand` in every dimension.
    pub fn covers(&self, demand: &ResourceVector) -> bool {
        demand.slots().all(|(slot, amount)| self.get(slot) >= amount)
    }

    /// Per-dimension shortfall of this vector against `demand`.
    /// Empty when `covers(demand)` holds.
    pub fn shortage(&self, demand: &ResourceVector) -> BTreeMap<String, u64> {
        demand
            .slots()
            .filter(|&(slot, amount)| self.get(slot) < amount)
            .map(|(slot, amount)| (slot.to_string(), amount - self.get(slot)))
            .collect()
    }

    /// Dominant share against a total capacity: the maximum fractional
    /// usage over all slots. Slots with zero total capacity impose no
    /// constraint and are skipped.
    pub fn dominant_share(&self, total: &ResourceVector) -> f64 {
        self.slots()
            .filter_map(|(slot, used)| {
                let cap = total.get(slot);
                (cap > 0).then(|| used as f64 / cap as f64)
            })
            .fold(0.0, f64::max)
    }
}

// ── Workloads ──────────────────────────────────────────────────────

/// Session kind as requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Interactive,
    Batch,
    Inference,
}

/// How the session's kernels are spread across agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    /// All kernels land on one agent (combined demand).
    SingleNode,
    /// Each kernel is placed independently.
    MultiNode,
}

/// One container within a session, with its own image and demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelWorkload {
    pub id: KernelId,
    /// Image reference (registry/name:tag).
    pub image: String,
    /// Required CPU architecture (must match the agent exactly).
    pub architecture: String,
    pub requested: ResourceVector,
}

/// One pending session awaiting placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionWorkload {
    pub id: SessionId,
    pub access_key: AccessKey,
    pub user_id: String,
    pub group_id: String,
    pub domain_id: String,
    pub resource_group: String,
    /// Session-level demand as submitted. Advisory only: per-kernel
    /// demand is authoritative for placement.
    pub requested: ResourceVector,
    /// Higher value = scheduled first. Lower tiers wait entirely.
    pub priority: i32,
    pub kind: SessionKind,
    pub cluster_mode: ClusterMode,
    /// Counted against the private (SFTP) concurrency ceiling.
    pub private_session: bool,
    /// Batch sessions only: do not schedule before this unix time.
    pub starts_at: Option<u64>,
    /// Pinned agent, if any. Bypasses strategy but not compatibility.
    pub designated_agent: Option<AgentId>,
    /// Sessions that must terminate successfully before this one runs.
    pub depends_on: Vec<SessionId>,
    pub kernels: Vec<KernelWorkload>,
}

impl SessionWorkload {
    /// Sum of per-kernel demands — the authoritative placement demand.
    pub fn total_demand(&self) -> ResourceVector {
        let mut total = ResourceVector::new();
        for kernel in &self.kernels {
            total.add(&kernel.requested);
        }
        total
    }
}

// ── Lifecycle ──────────────────────────────────────────────────────

/// Session/kernel lifecycle status, advanced only by the phase handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Scheduled,
    Preparing,
    Pulling,
    Prepared,
    Creating,
    Running,
    Terminating,
    Terminated,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Cancelled)
    }

    /// Cancellation is reachable from any pre-running state.
    pub fn may_cancel(self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::Scheduled
                | Self::Preparing
                | Self::Pulling
                | Self::Prepared
                | Self::Creating
        )
    }

    /// Counted against the owner's concurrency ceiling.
    pub fn is_concurrent(self) -> bool {
        !matches!(self, Self::Pending | Self::Terminated | Self::Cancelled)
    }
}

/// Outcome of a terminated session, used by dependency checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionResult {
    Success,
    Failure,
    Unknown,
}

// ── Agents ─────────────────────────────────────────────────────────

/// A worker agent's inventory as fetched fresh per pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub address: String,
    pub architecture: String,
    pub resource_group: String,
    /// Total slots this agent offers.
    pub available_slots: ResourceVector,
    /// Slots currently committed to live kernels.
    pub occupied_slots: ResourceVector,
    pub container_count: u32,
    /// Hard cap on containers. Zero means unlimited.
    pub max_containers: u32,
    pub schedulable: bool,
}

impl AgentInfo {
    /// Free headroom: available minus occupied, saturating.
    pub fn free_slots(&self) -> ResourceVector {
        let mut free = self.available_slots.clone();
        free.subtract(&self.occupied_slots);
        free
    }
}

// ── Policies ───────────────────────────────────────────────────────

/// Quota ceilings for one scope (access key, user, group, or domain).
/// Zero / empty ceilings mean unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// Occupancy ceiling per dimension. Dimensions absent from the
    /// ceiling are unconstrained.
    pub resource_ceiling: ResourceVector,
    pub max_concurrent_sessions: u32,
    pub max_concurrent_sftp_sessions: u32,
    pub max_pending_count: u32,
    pub max_pending_resource: ResourceVector,
}

/// Scope under which a policy or occupancy entry applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    AccessKey,
    User,
    Group,
    Domain,
}

impl QuotaScope {
    pub const ALL: [QuotaScope; 4] = [
        QuotaScope::AccessKey,
        QuotaScope::User,
        QuotaScope::Group,
        QuotaScope::Domain,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QuotaScope::AccessKey => "access_key",
            QuotaScope::User => "user",
            QuotaScope::Group => "group",
            QuotaScope::Domain => "domain",
        }
    }

    /// Composite key into the policies/occupancy tables.
    pub fn key(self, id: &str) -> String {
        format!("{}:{}", self.as_str(), id)
    }

    /// The scope id a workload carries for this scope.
    pub fn id_of(self, workload: &SessionWorkload) -> &str {
        match self {
            QuotaScope::AccessKey => &workload.access_key,
            QuotaScope::User => &workload.user_id,
            QuotaScope::Group => &workload.group_id,
            QuotaScope::Domain => &workload.domain_id,
        }
    }
}

/// Per-credential concurrency counters (regular and private sessions
/// are counted separately).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub active: u32,
    pub sftp: u32,
}

// ── Scheduling outputs ─────────────────────────────────────────────

/// A named pass/fail outcome recorded for audit on every workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingPredicate {
    pub name: String,
    pub message: String,
}

impl SchedulingPredicate {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Committed placement of one kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelAllocation {
    pub kernel_id: KernelId,
    pub agent_id: AgentId,
    pub agent_address: String,
    pub resource_group: String,
    pub host_ports: Vec<u16>,
}

/// Aggregated resource delta for one agent touched by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAllocation {
    pub agent_id: AgentId,
    pub delta: ResourceVector,
    /// Kernels placed on this agent (for container accounting).
    pub kernel_count: u32,
}

/// Committed output of the pipeline for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAllocation {
    pub session_id: SessionId,
    pub kind: SessionKind,
    pub cluster_mode: ClusterMode,
    pub resource_group: String,
    pub kernels: Vec<KernelAllocation>,
    pub agents: Vec<AgentAllocation>,
    pub passed: Vec<SchedulingPredicate>,
    pub failed: Vec<SchedulingPredicate>,
}

/// Why a session is still pending, persisted for the next pass and
/// for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingFailure {
    pub session_id: SessionId,
    pub passed: Vec<SchedulingPredicate>,
    pub failed: Vec<SchedulingPredicate>,
    /// Unix time of the attempt.
    pub last_attempt: u64,
    pub message: String,
}

/// The unit of commit: successes and failures land atomically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationBatch {
    pub allocations: Vec<SessionAllocation>,
    pub failures: Vec<SchedulingFailure>,
}

impl AllocationBatch {
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty() && self.failures.is_empty()
    }
}

// ── Persisted rows ─────────────────────────────────────────────────

/// One attempt in a session's scheduling history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingAttempt {
    pub at: u64,
    pub scheduled: bool,
    pub passed: Vec<SchedulingPredicate>,
    pub failed: Vec<SchedulingPredicate>,
    pub message: String,
}

/// Creation payload material generated once when a session starts:
/// cluster network name, SSH key pair, injected environment. Retries
/// of the creation phase must re-issue the same material the agents
/// already saw, so it is persisted rather than regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchInfo {
    pub network_name: String,
    pub cluster_size: u32,
    pub ssh_public_key: String,
    pub ssh_private_key: String,
    pub env: BTreeMap<String, String>,
}

/// Persisted session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    pub workload: SessionWorkload,
    pub status: SessionStatus,
    pub result: SessionResult,
    pub created_at: u64,
    pub status_changed_at: u64,
    /// Stuck-phase retries already spent.
    pub retries: u32,
    /// Past the retry ceiling; awaiting operator action.
    pub stuck: bool,
    /// Occupancy already handed back. Guards double release.
    pub occupancy_released: bool,
    /// Set at start time; `None` until the session first starts.
    #[serde(default)]
    pub launch: Option<LaunchInfo>,
    pub history: Vec<SchedulingAttempt>,
}

impl SessionRow {
    pub fn table_key(&self) -> &str {
        &self.workload.id
    }
}

/// Persisted kernel record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRow {
    pub session_id: SessionId,
    pub kernel: KernelWorkload,
    pub status: SessionStatus,
    pub agent_id: Option<AgentId>,
    pub agent_address: Option<String>,
    pub host_ports: Vec<u16>,
    pub status_changed_at: u64,
}

impl KernelRow {
    /// Build the composite key for the kernels table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.session_id, self.kernel.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_vector_add_subtract() {
        let mut v = ResourceVector::from_pairs([("cpu", 4), ("mem", 8)]);
        v.add(&ResourceVector::from_pairs([("cpu", 2), ("cuda.device", 1)]));
        assert_eq!(v.get("cpu"), 6);
        assert_eq!(v.get("cuda.device"), 1);

        v.subtract(&ResourceVector::from_pairs([("cpu", 10), ("mem", 3)]));
        assert_eq!(v.get("cpu"), 0); // saturates
        assert_eq!(v.get("mem"), 5);
    }

    #[test]
    fn covers_and_shortage() {
        let free = ResourceVector::from_pairs([("cpu", 4), ("mem", 8)]);
        let fits = ResourceVector::from_pairs([("cpu", 4)]);
        let too_big = ResourceVector::from_pairs([("cpu", 6), ("cuda.device", 1)]);

        assert!(free.covers(&fits));
        assert!(!free.covers(&too_big));

        let short = free.shortage(&too_big);
        assert_eq!(short.get("cpu"), Some(&2));
        assert_eq!(short.get("cuda.device"), Some(&1));
        assert!(free.shortage(&fits).is_empty());
    }

    #[test]
    fn dominant_share_skips_zero_capacity() {
        let total = ResourceVector::from_pairs([("cpu", 10), ("mem", 100)]);
        let used = ResourceVector::from_pairs([("cpu", 5), ("mem", 10), ("cuda.device", 3)]);

        // cuda.device has no capacity — skipped, not infinite.
        let share = used.dominant_share(&total);
        assert!((share - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_amounts_are_dropped() {
        let v = ResourceVector::from_pairs([("cpu", 0), ("mem", 1)]);
        assert_eq!(v.slots().count(), 1);
        assert!(ResourceVector::from_pairs([("cpu", 0u64)]).is_empty());
    }

    #[test]
    fn total_demand_sums_kernels() {
        let workload = SessionWorkload {
            id: "s1".into(),
            access_key: "ak1".into(),
            user_id: "u1".into(),
            group_id: "g1".into(),
            domain_id: "d1".into(),
            resource_group: "sg1".into(),
            requested: ResourceVector::new(),
            priority: 0,
            kind: SessionKind::Interactive,
            cluster_mode: ClusterMode::MultiNode,
            private_session: false,
            starts_at: None,
            designated_agent: None,
            depends_on: vec![],
            kernels: vec![
                KernelWorkload {
                    id: "k1".into(),
                    image: "python:3.12".into(),
                    architecture: "x86_64".into(),
                    requested: ResourceVector::from_pairs([("cpu", 2), ("mem", 2)]),
                },
                KernelWorkload {
                    id: "k2".into(),
                    image: "python:3.12".into(),
                    architecture: "x86_64".into(),
                    requested: ResourceVector::from_pairs([("cpu", 1)]),
                },
            ],
        };

        let total = workload.total_demand();
        assert_eq!(total.get("cpu"), 3);
        assert_eq!(total.get("mem"), 2);
    }

    #[test]
    fn status_transitions_classified() {
        assert!(SessionStatus::Terminated.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());

        assert!(SessionStatus::Pending.may_cancel());
        assert!(SessionStatus::Creating.may_cancel());
        assert!(!SessionStatus::Running.may_cancel());

        assert!(SessionStatus::Running.is_concurrent());
        assert!(!SessionStatus::Pending.is_concurrent());
    }

    #[test]
    fn agent_free_slots() {
        let agent = AgentInfo {
            id: "a1".into(),
            address: "10.0.0.1:6001".into(),
            architecture: "x86_64".into(),
            resource_group: "sg1".into(),
            available_slots: ResourceVector::from_pairs([("cpu", 8), ("mem", 16)]),
            occupied_slots: ResourceVector::from_pairs([("cpu", 3)]),
            container_count: 1,
            max_containers: 0,
            schedulable: true,
        };

        let free = agent.free_slots();
        assert_eq!(free.get("cpu"), 5);
        assert_eq!(free.get("mem"), 16);
    }

    #[test]
    fn quota_scope_keys() {
        assert_eq!(QuotaScope::AccessKey.key("ak1"), "access_key:ak1");
        assert_eq!(QuotaScope::Domain.key("default"), "domain:default");
    }
}
