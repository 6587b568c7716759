//! One scheduling pass, end to end.
//!
//! The provisioner drives the pipeline for one resource group:
//!
//! 1. fetch the scheduling data (pending workloads, agents, snapshot),
//! 2. apply the priority cliff and the configured sequencer,
//! 3. validate each contender against the admission rules,
//! 4. select agents for the validated workloads,
//! 5. commit successes and failures as one atomic batch.
//!
//! Rejections never abort the pass: they become recorded failures and
//! the next workload is considered against the updated pass state. An
//! empty queue is a no-op, so redundant timer wakeups are harmless.

use sokovan_state::{
    AgentAllocation, AllocationBatch, KernelAllocation, ResourceVector, SchedulingFailure,
    SchedulingPredicate, SessionAllocation, SessionId, SessionStore, SessionWorkload,
};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::allocator::Allocator;
use crate::error::ScheduleResult;
use crate::selector::{AgentSelector, AgentTracker, KernelSelection, SelectionStrategy};
use crate::sequencer::{priority_cliff, Sequencer};
use crate::validators::{default_rules, epoch_secs, validate_workload, SchedulingRule};

/// What one pass did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub resource_group: String,
    /// The priority tier that contended, if the queue was non-empty.
    pub tier: Option<i32>,
    pub scheduled: Vec<SessionId>,
    pub rejected: Vec<SessionId>,
}

/// Per-resource-group scheduling pipeline.
pub struct Provisioner {
    store: SessionStore,
    allocator: Allocator,
    rules: Vec<Box<dyn SchedulingRule>>,
    sequencer: Sequencer,
    selector: AgentSelector,
}

impl Provisioner {
    pub fn new(store: SessionStore, sequencer: Sequencer, strategy: SelectionStrategy) -> Self {
        Self::with_rules(store, sequencer, strategy, default_rules())
    }

    pub fn with_rules(
        store: SessionStore,
        sequencer: Sequencer,
        strategy: SelectionStrategy,
        rules: Vec<Box<dyn SchedulingRule>>,
    ) -> Self {
        let allocator = Allocator::new(store.clone());
        Self {
            store,
            allocator,
            rules,
            sequencer,
            selector: AgentSelector::new(strategy),
        }
    }

    /// Run one pass over the resource group's pending queue.
    pub fn pass(&mut self, resource_group: &str) -> ScheduleResult<PassSummary> {
        let data = self.store.scheduling_data(resource_group)?;
        let mut summary = PassSummary {
            resource_group: resource_group.to_string(),
            ..Default::default()
        };
        if data.workloads.is_empty() {
            debug!(resource_group, "no pending workloads");
            return Ok(summary);
        }

        let mut snapshot = data.snapshot;
        let mut trackers: Vec<AgentTracker> =
            data.agents.into_iter().map(AgentTracker::new).collect();

        let (tier, contenders) = priority_cliff(data.workloads);
        summary.tier = tier;
        let ordered = self.sequencer.sequence(&snapshot, contenders);

        let mut batch = AllocationBatch::default();
        for workload in ordered {
            let (passed, failed) = validate_workload(&self.rules, &snapshot, &workload);
            if !failed.is_empty() {
                debug!(session_id = %workload.id, rules = failed.len(), "workload rejected");
                batch.failures.push(failure_record(&workload, passed, failed));
                continue;
            }

            match self.selector.select(&mut trackers, &workload) {
                Ok(selections) => {
                    snapshot.apply_allocation(&workload);
                    batch
                        .allocations
                        .push(build_allocation(&workload, selections, passed));
                }
                Err(err) => {
                    debug!(session_id = %workload.id, %err, "no agent for workload");
                    let failed =
                        vec![SchedulingPredicate::new("agent_selection", err.to_string())];
                    batch.failures.push(failure_record(&workload, passed, failed));
                }
            }
        }

        summary.rejected = batch.failures.iter().map(|f| f.session_id.clone()).collect();
        let committed = self.allocator.commit(&batch)?;
        summary.scheduled = committed.into_iter().map(|a| a.session_id).collect();

        // Unresolved failures re-arm the pass for the next wakeup.
        if !batch.failures.is_empty() {
            self.store
                .mark_needed(&format!("schedule:{resource_group}"))?;
        }

        info!(
            resource_group,
            tier = ?summary.tier,
            scheduled = summary.scheduled.len(),
            rejected = summary.rejected.len(),
            "scheduling pass finished"
        );
        Ok(summary)
    }
}

fn failure_record(
    workload: &SessionWorkload,
    passed: Vec<SchedulingPredicate>,
    failed: Vec<SchedulingPredicate>,
) -> SchedulingFailure {
    let message = failed
        .iter()
        .map(|p| format!("{}: {}", p.name, p.message))
        .collect::<Vec<_>>()
        .join("; ");
    SchedulingFailure {
        session_id: workload.id.clone(),
        passed,
        failed,
        last_attempt: epoch_secs(),
        message,
    }
}

fn build_allocation(
    workload: &SessionWorkload,
    selections: Vec<KernelSelection>,
    passed: Vec<SchedulingPredicate>,
) -> SessionAllocation {
    let demands: HashMap<&str, &ResourceVector> = workload
        .kernels
        .iter()
        .map(|k| (k.id.as_str(), &k.requested))
        .collect();

    // Aggregate per-agent deltas for container and slot accounting.
    let mut agents: Vec<AgentAllocation> = Vec::new();
    let mut kernels = Vec::with_capacity(selections.len());
    for selection in selections {
        if let Some(demand) = demands.get(selection.kernel_id.as_str()) {
            match agents.iter_mut().find(|a| a.agent_id == selection.agent_id) {
                Some(entry) => {
                    entry.delta.add(demand);
                    entry.kernel_count += 1;
                }
                None => agents.push(AgentAllocation {
                    agent_id: selection.agent_id.clone(),
                    delta: (*demand).clone(),
                    kernel_count: 1,
                }),
            }
        }
        kernels.push(KernelAllocation {
            kernel_id: selection.kernel_id,
            agent_id: selection.agent_id,
            agent_address: selection.agent_address,
            resource_group: workload.resource_group.clone(),
            host_ports: Vec::new(),
        });
    }

    SessionAllocation {
        session_id: workload.id.clone(),
        kind: workload.kind,
        cluster_mode: workload.cluster_mode,
        resource_group: workload.resource_group.clone(),
        kernels,
        agents,
        passed,
        failed: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sokovan_state::{
        AgentInfo, ClusterMode, KernelWorkload, QuotaScope, ResourcePolicy, SessionKind,
        SessionStatus,
    };

    fn agent(id: &str, cpu: u64, mem: u64) -> AgentInfo {
        AgentInfo {
            id: id.into(),
            address: format!("10.0.0.{}:6001", &id[1..]),
            architecture: "x86_64".into(),
            resource_group: "sg1".into(),
            available_slots: ResourceVector::from_pairs([("cpu", cpu), ("mem", mem)]),
            occupied_slots: ResourceVector::new(),
            container_count: 0,
            max_containers: 0,
            schedulable: true,
        }
    }

    fn workload(id: &str, access_key: &str, cpu: u64, mem: u64) -> SessionWorkload {
        SessionWorkload {
            id: id.into(),
            access_key: access_key.into(),
            user_id: format!("u-{access_key}"),
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

    #[test]
    fn empty_queue_is_a_noop() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut provisioner =
            Provisioner::new(store, Sequencer::Fifo, SelectionStrategy::Concentrated);

        let summary = provisioner.pass("sg1").unwrap();
        assert_eq!(summary.tier, None);
        assert!(summary.scheduled.is_empty());
        assert!(summary.rejected.is_empty());

        // Redundant wakeups stay harmless.
        provisioner.pass("sg1").unwrap();
    }

    #[test]
    fn drf_concentrated_end_to_end() {
        let store = SessionStore::open_in_memory().unwrap();
        store.put_agent(&agent("a1", 4, 8)).unwrap();
        store.put_agent(&agent("a2", 2, 4)).unwrap();

        // ak1 already dominates cpu at 50%; ak2 sits near 8% on mem.
        store
            .add_occupancy(
                QuotaScope::AccessKey,
                "ak1",
                &ResourceVector::from_pairs([("cpu", 3u64)]),
            )
            .unwrap();
        store
            .add_occupancy(
                QuotaScope::AccessKey,
                "ak2",
                &ResourceVector::from_pairs([("mem", 1u64)]),
            )
            .unwrap();

        store.enqueue_session(&workload("s1", "ak1", 2, 2)).unwrap();
        store.enqueue_session(&workload("s2", "ak2", 1, 1)).unwrap();

        let mut provisioner = Provisioner::new(
            store.clone(),
            Sequencer::Drf,
            SelectionStrategy::Concentrated,
        );
        let summary = provisioner.pass("sg1").unwrap();

        // DRF schedules the lighter credential first; both still land.
        assert_eq!(summary.scheduled, ["s2", "s1"]);
        assert!(summary.rejected.is_empty());

        for id in ["s1", "s2"] {
            let row = store.get_session(id).unwrap().unwrap();
            assert_eq!(row.status, SessionStatus::Scheduled);
            for kernel in store.kernels_for_session(id).unwrap() {
                assert_eq!(kernel.agent_id.as_deref(), Some("a1"));
            }
        }

        // Concentrated packs everything onto a1; a2 stays untouched.
        let a1 = store.get_agent("a1").unwrap().unwrap();
        assert_eq!(a1.occupied_slots.get("cpu"), 3);
        assert_eq!(a1.occupied_slots.get("mem"), 3);
        assert_eq!(a1.container_count, 2);
        let a2 = store.get_agent("a2").unwrap().unwrap();
        assert!(a2.occupied_slots.is_empty());

        // ak1's durable occupancy now includes the new session.
        let occ = store.occupancy(QuotaScope::AccessKey, "ak1").unwrap();
        assert_eq!(occ.get("cpu"), 5);
        assert_eq!(occ.get("mem"), 2);
    }

    #[test]
    fn lower_priority_tier_waits_without_failure() {
        let store = SessionStore::open_in_memory().unwrap();
        store.put_agent(&agent("a1", 8, 16)).unwrap();

        let mut high = workload("s-high", "ak1", 1, 1);
        high.priority = 10;
        store.enqueue_session(&high).unwrap();
        store.enqueue_session(&workload("s-low", "ak2", 1, 1)).unwrap();

        let mut provisioner =
            Provisioner::new(store.clone(), Sequencer::Fifo, SelectionStrategy::Concentrated);
        let summary = provisioner.pass("sg1").unwrap();

        assert_eq!(summary.tier, Some(10));
        assert_eq!(summary.scheduled, ["s-high"]);

        // The lower tier was never considered: still pending, no failure.
        let low = store.get_session("s-low").unwrap().unwrap();
        assert_eq!(low.status, SessionStatus::Pending);
        assert!(store.last_failure("s-low").unwrap().is_none());
    }

    #[test]
    fn rejected_workload_records_failure_and_marker() {
        let store = SessionStore::open_in_memory().unwrap();
        store.put_agent(&agent("a1", 8, 16)).unwrap();
        store
            .put_policy(
                QuotaScope::AccessKey,
                "ak1",
                &ResourcePolicy {
                    max_concurrent_sessions: 1,
                    ..Default::default()
                },
            )
            .unwrap();

        // One running session exhausts the ceiling.
        store.enqueue_session(&workload("s0", "ak1", 1, 1)).unwrap();
        store
            .transition_sessions(
                &["s0".into()],
                &[SessionStatus::Pending],
                SessionStatus::Running,
            )
            .unwrap();
        store.enqueue_session(&workload("s1", "ak1", 1, 1)).unwrap();

        let mut provisioner =
            Provisioner::new(store.clone(), Sequencer::Fifo, SelectionStrategy::Concentrated);
        let summary = provisioner.pass("sg1").unwrap();

        assert!(summary.scheduled.is_empty());
        assert_eq!(summary.rejected, ["s1"]);

        let row = store.get_session("s1").unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Pending);
        let failure = store.last_failure("s1").unwrap().unwrap();
        assert!(failure.failed.iter().any(|p| p.name == "concurrency_limit"));
        assert!(!failure.passed.is_empty());

        // The unresolved failure re-arms the next wakeup.
        assert!(store.load_and_clear("schedule:sg1").unwrap());
        assert!(!store.load_and_clear("schedule:sg1").unwrap());
    }

    #[test]
    fn no_agent_fit_records_selection_failure() {
        let store = SessionStore::open_in_memory().unwrap();
        store.put_agent(&agent("a1", 2, 4)).unwrap();
        store.enqueue_session(&workload("s1", "ak1", 8, 8)).unwrap();

        let mut provisioner =
            Provisioner::new(store.clone(), Sequencer::Fifo, SelectionStrategy::Dispersed);
        let summary = provisioner.pass("sg1").unwrap();

        assert_eq!(summary.rejected, ["s1"]);
        let failure = store.last_failure("s1").unwrap().unwrap();
        assert_eq!(failure.failed.len(), 1);
        assert_eq!(failure.failed[0].name, "agent_selection");
        assert!(failure.failed[0].message.contains("insufficient resources"));
    }

    #[test]
    fn earlier_allocations_constrain_later_workloads() {
        let store = SessionStore::open_in_memory().unwrap();
        store.put_agent(&agent("a1", 3, 8)).unwrap();
        store.enqueue_session(&workload("s1", "ak1", 2, 2)).unwrap();
        store.enqueue_session(&workload("s2", "ak2", 2, 2)).unwrap();

        let mut provisioner =
            Provisioner::new(store.clone(), Sequencer::Fifo, SelectionStrategy::Concentrated);
        let summary = provisioner.pass("sg1").unwrap();

        // s1 consumes 2 of 3 cpus in-pass; s2 no longer fits.
        assert_eq!(summary.scheduled, ["s1"]);
        assert_eq!(summary.rejected, ["s2"]);
    }
}
