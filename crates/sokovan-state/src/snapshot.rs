//! Pass-scoped system snapshot.
//!
//! A `SystemSnapshot` is the point-in-time view of occupancy, policy,
//! concurrency, and dependency state that one scheduling pass reads.
//! It is never shared across concurrent passes: each pass owns a
//! private copy, and only the provisioner's loop body mutates it (via
//! [`SystemSnapshot::apply_allocation`]) so later workloads in the same
//! pass see earlier allocations.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::*;

/// Dependency state of one predecessor session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyState {
    pub id: SessionId,
    pub status: SessionStatus,
    pub result: SessionResult,
}

impl DependencyState {
    /// A dependency is met only when terminated with success.
    pub fn is_met(&self) -> bool {
        self.status == SessionStatus::Terminated && self.result == SessionResult::Success
    }
}

/// A pending session summary used by pending-ceiling checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSession {
    pub id: SessionId,
    pub requested: ResourceVector,
}

/// Everything one scheduling pass needs, fetched in one read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub resource_group: String,
    /// Total capacity across the resource group's schedulable agents.
    pub total_capacity: ResourceVector,
    /// Occupancy keyed by `{scope}:{id}`.
    pub occupancy: HashMap<String, ResourceVector>,
    /// Policies keyed by `{scope}:{id}`.
    pub policies: HashMap<String, ResourcePolicy>,
    /// Concurrency counters per access key.
    pub concurrency: HashMap<AccessKey, SessionCounters>,
    /// Currently-pending sessions per access key (cluster-wide).
    pub pending: HashMap<AccessKey, Vec<PendingSession>>,
    /// Dependency states per pending session id.
    pub dependencies: HashMap<SessionId, Vec<DependencyState>>,
    /// External fair-share ranks keyed by `{group_id}/{user_id}`.
    /// Missing rank sorts last.
    pub fair_share_ranks: HashMap<String, f64>,
}

impl SystemSnapshot {
    pub fn occupancy_for(&self, scope: QuotaScope, id: &str) -> ResourceVector {
        self.occupancy.get(&scope.key(id)).cloned().unwrap_or_default()
    }

    pub fn policy_for(&self, scope: QuotaScope, id: &str) -> Option<&ResourcePolicy> {
        self.policies.get(&scope.key(id))
    }

    pub fn counters_for(&self, access_key: &str) -> SessionCounters {
        self.concurrency.get(access_key).copied().unwrap_or_default()
    }

    pub fn pending_for(&self, access_key: &str) -> &[PendingSession] {
        self.pending.get(access_key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Current dominant share of a credential against total capacity.
    pub fn dominant_share_for(&self, access_key: &str) -> f64 {
        self.occupancy_for(QuotaScope::AccessKey, access_key)
            .dominant_share(&self.total_capacity)
    }

    pub fn fair_share_rank(&self, group_id: &str, user_id: &str) -> Option<f64> {
        self.fair_share_ranks
            .get(&format!("{group_id}/{user_id}"))
            .copied()
    }

    /// Absorb a successful allocation so later workloads in the same
    /// pass see the reduced headroom and bumped counters.
    pub fn apply_allocation(&mut self, workload: &SessionWorkload) {
        let demand = workload.total_demand();

        for scope in QuotaScope::ALL {
            let key = scope.key(scope.id_of(workload));
            self.occupancy.entry(key).or_default().add(&demand);
        }

        let counters = self.concurrency.entry(workload.access_key.clone()).or_default();
        if workload.private_session {
            counters.sftp += 1;
        } else {
            counters.active += 1;
        }

        if let Some(pending) = self.pending.get_mut(&workload.access_key) {
            pending.retain(|p| p.id != workload.id);
        }
    }
}
