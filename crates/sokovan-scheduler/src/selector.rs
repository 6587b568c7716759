//! Agent selection for validated workloads.
//!
//! Selection operates on pass-scoped [`AgentTracker`]s: mutable copies
//! of the agents' inventories that absorb in-pass placements, so later
//! workloads in the same pass see the reduced headroom before anything
//! is committed. Compatibility (architecture, free resources, container
//! ceiling) is non-negotiable; the strategy only ranks the compatible.
//!
//! Multi-kernel placement is staged: tracker mutations take effect only
//! when every kernel of the session found an agent, so a partial fit
//! never leaks into the pass.

use sokovan_state::{
    AgentId, AgentInfo, ClusterMode, KernelId, ResourceVector, SessionWorkload,
};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ScheduleError;

/// Resource ordering used by the legacy strategy's tie-breaks:
/// scarcer device slots compare before commodity slots.
const RESOURCE_PRIORITY: [&str; 4] = ["cuda.device", "cuda.shares", "cpu", "mem"];

// ── Trackers ───────────────────────────────────────────────────────

/// Pass-scoped mutable view of one agent's inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTracker {
    pub info: AgentInfo,
}

impl AgentTracker {
    pub fn new(info: AgentInfo) -> Self {
        Self { info }
    }

    pub fn free(&self) -> ResourceVector {
        self.info.free_slots()
    }

    /// Record a placement: consume slots and count the containers.
    pub fn allocate(&mut self, demand: &ResourceVector, kernels: u32) {
        self.info.occupied_slots.add(demand);
        self.info.container_count += kernels;
    }

    /// Why this agent cannot host the demand, if it cannot.
    fn incompatibility(
        &self,
        architecture: &str,
        demand: &ResourceVector,
        kernels: u32,
    ) -> Option<Incompatibility> {
        if self.info.architecture != architecture {
            return Some(Incompatibility::ArchitectureMismatch {
                required: architecture.to_string(),
                actual: self.info.architecture.clone(),
            });
        }
        if self.info.max_containers > 0
            && self.info.container_count + kernels > self.info.max_containers
        {
            return Some(Incompatibility::ContainerLimitExceeded {
                count: self.info.container_count,
                max: self.info.max_containers,
            });
        }
        let free = self.free();
        if !free.covers(demand) {
            return Some(Incompatibility::InsufficientResources {
                shortage: free.shortage(demand),
            });
        }
        None
    }
}

// ── Errors ─────────────────────────────────────────────────────────

/// Why one particular agent was ruled out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incompatibility {
    ArchitectureMismatch { required: String, actual: String },
    InsufficientResources { shortage: BTreeMap<String, u64> },
    ContainerLimitExceeded { count: u32, max: u32 },
}

impl fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArchitectureMismatch { required, actual } => {
                write!(f, "architecture mismatch (needs {required}, has {actual})")
            }
            Self::InsufficientResources { shortage } => {
                write!(f, "insufficient resources (short ")?;
                for (i, (slot, amount)) in shortage.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{slot}:{amount}")?;
                }
                write!(f, ")")
            }
            Self::ContainerLimitExceeded { count, max } => {
                write!(f, "container limit exceeded ({count}/{max})")
            }
        }
    }
}

/// Selection failure for one workload (or one of its kernels).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    /// The candidate pool was empty.
    NoAvailableAgent,
    /// Agents exist but none can host, with per-agent reasons.
    NoCompatibleAgent {
        details: Vec<(AgentId, Incompatibility)>,
    },
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAvailableAgent => write!(f, "no available agent in resource group"),
            Self::NoCompatibleAgent { details } => {
                write!(f, "no compatible agent:")?;
                for (agent, why) in details {
                    write!(f, " {agent}: {why};")?;
                }
                Ok(())
            }
        }
    }
}

// ── Strategies ─────────────────────────────────────────────────────

/// How the compatible candidates are ranked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Prefer agents already exercising the requested slot types, then
    /// the one with the least utilization headroom. Follow-up workloads
    /// gravitate to agents already in use, keeping the rest free.
    #[default]
    Concentrated,
    /// Prefer the least-utilized compatible agent to spread load.
    Dispersed,
    /// Rotate through the compatible agents in id order.
    RoundRobin,
    /// Concentrated compatibility with the fixed resource-priority
    /// ordering older deployments used for tie-breaks.
    Legacy,
}

impl FromStr for SelectionStrategy {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concentrated" => Ok(Self::Concentrated),
            "dispersed" => Ok(Self::Dispersed),
            "roundrobin" | "round_robin" | "round-robin" => Ok(Self::RoundRobin),
            "legacy" => Ok(Self::Legacy),
            other => Err(ScheduleError::UnknownStrategy(other.to_string())),
        }
    }
}

/// One kernel's chosen host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSelection {
    pub kernel_id: KernelId,
    pub agent_id: AgentId,
    pub agent_address: String,
}

/// Stateful selector: round-robin keeps a rotating cursor across
/// passes; the other strategies are stateless.
#[derive(Debug)]
pub struct AgentSelector {
    strategy: SelectionStrategy,
    rr_cursor: usize,
}

impl AgentSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            rr_cursor: 0,
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Place every kernel of the workload, mutating `trackers` only on
    /// full success.
    pub fn select(
        &mut self,
        trackers: &mut [AgentTracker],
        workload: &SessionWorkload,
    ) -> Result<Vec<KernelSelection>, SelectionError> {
        if trackers.is_empty() {
            return Err(SelectionError::NoAvailableAgent);
        }

        let mut staged: Vec<AgentTracker> = trackers.to_vec();
        let mut cursor = self.rr_cursor;
        let mut selections = Vec::with_capacity(workload.kernels.len());

        match workload.cluster_mode {
            ClusterMode::SingleNode => {
                // One agent hosts the combined demand of every kernel.
                let demand = workload.total_demand();
                let architecture = workload
                    .kernels
                    .first()
                    .map(|k| k.architecture.as_str())
                    .unwrap_or_default();
                let kernels = workload.kernels.len() as u32;

                let idx = self.pick(
                    &staged,
                    workload.designated_agent.as_deref(),
                    architecture,
                    &demand,
                    kernels,
                    &mut cursor,
                )?;
                staged[idx].allocate(&demand, kernels);
                for kernel in &workload.kernels {
                    selections.push(KernelSelection {
                        kernel_id: kernel.id.clone(),
                        agent_id: staged[idx].info.id.clone(),
                        agent_address: staged[idx].info.address.clone(),
                    });
                }
            }
            ClusterMode::MultiNode => {
                for kernel in &workload.kernels {
                    let idx = self.pick(
                        &staged,
                        workload.designated_agent.as_deref(),
                        &kernel.architecture,
                        &kernel.requested,
                        1,
                        &mut cursor,
                    )?;
                    staged[idx].allocate(&kernel.requested, 1);
                    selections.push(KernelSelection {
                        kernel_id: kernel.id.clone(),
                        agent_id: staged[idx].info.id.clone(),
                        agent_address: staged[idx].info.address.clone(),
                    });
                }
            }
        }

        trackers.clone_from_slice(&staged);
        self.rr_cursor = cursor;
        Ok(selections)
    }

    /// Choose one tracker index for one unit of demand.
    fn pick(
        &self,
        staged: &[AgentTracker],
        designated: Option<&str>,
        architecture: &str,
        demand: &ResourceVector,
        kernels: u32,
        cursor: &mut usize,
    ) -> Result<usize, SelectionError> {
        // Candidate indices in deterministic id order. A designated
        // agent narrows the pool but still passes compatibility.
        let mut candidates: Vec<usize> = (0..staged.len())
            .filter(|&i| designated.is_none_or(|id| staged[i].info.id == id))
            .collect();
        candidates.sort_by(|&a, &b| staged[a].info.id.cmp(&staged[b].info.id));
        if candidates.is_empty() {
            return Err(SelectionError::NoAvailableAgent);
        }

        let mut details = Vec::new();
        let compatible: Vec<usize> = candidates
            .into_iter()
            .filter(|&i| match staged[i].incompatibility(architecture, demand, kernels) {
                Some(why) => {
                    details.push((staged[i].info.id.clone(), why));
                    false
                }
                None => true,
            })
            .collect();
        if compatible.is_empty() {
            return Err(SelectionError::NoCompatibleAgent { details });
        }

        let chosen = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let idx = compatible[*cursor % compatible.len()];
                *cursor += 1;
                idx
            }
            SelectionStrategy::Concentrated => rank_min(staged, &compatible, |a, b| {
                new_slot_types(a, demand)
                    .cmp(&new_slot_types(b, demand))
                    .then_with(|| cmp_f64(headroom(a, demand), headroom(b, demand)))
            }),
            SelectionStrategy::Dispersed => rank_min(staged, &compatible, |a, b| {
                new_slot_types(a, demand)
                    .cmp(&new_slot_types(b, demand))
                    .then_with(|| cmp_f64(headroom(b, demand), headroom(a, demand)))
            }),
            SelectionStrategy::Legacy => rank_min(staged, &compatible, |a, b| {
                new_slot_types(a, demand)
                    .cmp(&new_slot_types(b, demand))
                    .then_with(|| {
                        for slot in RESOURCE_PRIORITY {
                            let ord = a.free().get(slot).cmp(&b.free().get(slot));
                            if ord != std::cmp::Ordering::Equal {
                                return ord;
                            }
                        }
                        std::cmp::Ordering::Equal
                    })
            }),
        };
        Ok(chosen)
    }
}

/// First minimum under `cmp` over the candidate indices; candidates
/// arrive id-ordered, so ties resolve to the lowest agent id.
fn rank_min(
    staged: &[AgentTracker],
    compatible: &[usize],
    mut cmp: impl FnMut(&AgentTracker, &AgentTracker) -> std::cmp::Ordering,
) -> usize {
    let mut best = compatible[0];
    for &i in &compatible[1..] {
        if cmp(&staged[i], &staged[best]) == std::cmp::Ordering::Less {
            best = i;
        }
    }
    best
}

fn cmp_f64(a: f64, b: f64) -> std::cmp::Ordering {
    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
}

/// Requested slot types this agent is not exercising yet.
fn new_slot_types(tracker: &AgentTracker, demand: &ResourceVector) -> usize {
    demand
        .slots()
        .filter(|&(slot, _)| tracker.info.occupied_slots.get(slot) == 0)
        .count()
}

/// Utilization headroom over the requested dimensions: the smallest
/// free fraction among demanded slots the agent offers, measured
/// before hosting the demand. In-pass placements are already
/// reflected in the tracker's occupancy.
///
/// Measuring before hosting keeps idle agents tied regardless of
/// their size, so first placements fall to the deterministic id
/// tie-break instead of agent capacity. On pools with uniform
/// per-slot capacity the ordering is identical to post-hosting
/// headroom (hosting shifts every candidate by the same fraction);
/// the two diverge only when candidate capacities differ.
fn headroom(tracker: &AgentTracker, demand: &ResourceVector) -> f64 {
    let info = &tracker.info;
    demand
        .slots()
        .filter_map(|(slot, _)| {
            let cap = info.available_slots.get(slot);
            (cap > 0).then(|| {
                let free = cap.saturating_sub(info.occupied_slots.get(slot));
                free as f64 / cap as f64
            })
        })
        .fold(f64::INFINITY, f64::min)
}
