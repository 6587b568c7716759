//! Admission rules run against every workload before placement.
//!
//! Every rule runs on every workload even after the first violation,
//! so a rejected session records the full picture: which checks passed
//! and which failed, by name, with a human-readable message each.
//! Rejection is per-workload and non-fatal; the pass moves on.

use sokovan_state::{QuotaScope, SessionKind, SessionWorkload, SchedulingPredicate, SystemSnapshot};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A named rule violation. `rule` matches the emitting rule's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleViolation {
    pub rule: &'static str,
    pub message: String,
}

/// One admission check. Rules are pure: they read the snapshot and the
/// workload, and never touch the store.
pub trait SchedulingRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(
        &self,
        snapshot: &SystemSnapshot,
        workload: &SessionWorkload,
    ) -> Result<(), RuleViolation>;

    fn violation(&self, message: impl Into<String>) -> RuleViolation
    where
        Self: Sized,
    {
        RuleViolation {
            rule: self.name(),
            message: message.into(),
        }
    }
}

/// Run every rule and split the outcomes into passed/failed predicates.
pub fn validate_workload(
    rules: &[Box<dyn SchedulingRule>],
    snapshot: &SystemSnapshot,
    workload: &SessionWorkload,
) -> (Vec<SchedulingPredicate>, Vec<SchedulingPredicate>) {
    let mut passed = Vec::new();
    let mut failed = Vec::new();
    for rule in rules {
        match rule.validate(snapshot, workload) {
            Ok(()) => passed.push(SchedulingPredicate::new(rule.name(), "passed")),
            Err(v) => failed.push(SchedulingPredicate::new(v.rule, v.message)),
        }
    }
    (passed, failed)
}

/// The default rule set, in evaluation order.
pub fn default_rules() -> Vec<Box<dyn SchedulingRule>> {
    vec![
        Box::new(ConcurrencyLimit),
        Box::new(DependenciesResolved),
        Box::new(ResourceQuota::new(QuotaScope::AccessKey)),
        Box::new(ResourceQuota::new(QuotaScope::User)),
        Box::new(ResourceQuota::new(QuotaScope::Group)),
        Box::new(ResourceQuota::new(QuotaScope::Domain)),
        Box::new(PendingSessionLimit),
        Box::new(ReservedBatchStart),
    ]
}

// ── Concurrency ────────────────────────────────────────────────────

/// Caps live sessions per access key. Private (SFTP) sessions count
/// against their own separate ceiling.
pub struct ConcurrencyLimit;

impl SchedulingRule for ConcurrencyLimit {
    fn name(&self) -> &'static str {
        "concurrency_limit"
    }

    fn validate(
        &self,
        snapshot: &SystemSnapshot,
        workload: &SessionWorkload,
    ) -> Result<(), RuleViolation> {
        let Some(policy) = snapshot.policy_for(QuotaScope::AccessKey, &workload.access_key)
        else {
            return Ok(());
        };

        let counters = snapshot.counters_for(&workload.access_key);
        let (label, count, ceiling) = if workload.private_session {
            ("sftp", counters.sftp, policy.max_concurrent_sftp_sessions)
        } else {
            ("regular", counters.active, policy.max_concurrent_sessions)
        };

        // Zero ceiling means unlimited.
        if ceiling > 0 && count >= ceiling {
            return Err(self.violation(format!(
                "access key {} has {count} {label} sessions (ceiling {ceiling})",
                workload.access_key,
            )));
        }
        Ok(())
    }
}

// ── Dependencies ───────────────────────────────────────────────────

/// Every predecessor named by the workload must have terminated with
/// a success result.
pub struct DependenciesResolved;

impl SchedulingRule for DependenciesResolved {
    fn name(&self) -> &'static str {
        "dependencies_resolved"
    }

    fn validate(
        &self,
        snapshot: &SystemSnapshot,
        workload: &SessionWorkload,
    ) -> Result<(), RuleViolation> {
        if workload.depends_on.is_empty() {
            return Ok(());
        }
        let deps = snapshot.dependencies.get(&workload.id);
        let unmet: Vec<&str> = match deps {
            Some(states) => states
                .iter()
                .filter(|d| !d.is_met())
                .map(|d| d.id.as_str())
                .collect(),
            // No resolved states at all: every named dependency is unmet.
            None => workload.depends_on.iter().map(String::as_str).collect(),
        };
        if unmet.is_empty() {
            Ok(())
        } else {
            Err(self.violation(format!("unresolved dependencies: {}", unmet.join(", "))))
        }
    }
}

// ── Resource quotas ────────────────────────────────────────────────

/// Rejects a workload whose demand, added to the scope's current
/// occupancy, would exceed the scope's ceiling in any dimension.
/// Dimensions absent from the ceiling are unconstrained.
pub struct ResourceQuota {
    scope: QuotaScope,
}

impl ResourceQuota {
    pub fn new(scope: QuotaScope) -> Self {
        Self { scope }
    }
}

impl SchedulingRule for ResourceQuota {
    fn name(&self) -> &'static str {
        match self.scope {
            QuotaScope::AccessKey => "keypair_resource_quota",
            QuotaScope::User => "user_resource_quota",
            QuotaScope::Group => "group_resource_quota",
            QuotaScope::Domain => "domain_resource_quota",
        }
    }

    fn validate(
        &self,
        snapshot: &SystemSnapshot,
        workload: &SessionWorkload,
    ) -> Result<(), RuleViolation> {
        let id = self.scope.id_of(workload);
        let Some(policy) = snapshot.policy_for(self.scope, id) else {
            return Ok(());
        };
        if policy.resource_ceiling.is_empty() {
            return Ok(());
        }

        let mut projected = snapshot.occupancy_for(self.scope, id);
        projected.add(&workload.total_demand());

        let exceeded: Vec<String> = policy
            .resource_ceiling
            .slots()
            .filter(|&(slot, cap)| projected.get(slot) > cap)
            .map(|(slot, cap)| format!("{slot} ({} > {cap})", projected.get(slot)))
            .collect();

        if exceeded.is_empty() {
            Ok(())
        } else {
            Err(self.violation(format!(
                "{} {id} would exceed its quota in: {}",
                self.scope.as_str(),
                exceeded.join(", "),
            )))
        }
    }
}

// ── Pending ceiling ────────────────────────────────────────────────

/// Caps how many sessions (and how much pending demand) one access key
/// may keep queued, computed cluster-wide over currently-pending rows.
/// The workload under evaluation is itself part of the pending set.
pub struct PendingSessionLimit;

impl SchedulingRule for PendingSessionLimit {
    fn name(&self) -> &'static str {
        "pending_session_limit"
    }

    fn validate(
        &self,
        snapshot: &SystemSnapshot,
        workload: &SessionWorkload,
    ) -> Result<(), RuleViolation> {
        let Some(policy) = snapshot.policy_for(QuotaScope::AccessKey, &workload.access_key)
        else {
            return Ok(());
        };

        let pending = snapshot.pending_for(&workload.access_key);

        if policy.max_pending_count > 0 && pending.len() as u32 > policy.max_pending_count {
            return Err(self.violation(format!(
                "access key {} has {} pending sessions (ceiling {})",
                workload.access_key,
                pending.len(),
                policy.max_pending_count,
            )));
        }

        if !policy.max_pending_resource.is_empty() {
            let mut total = sokovan_state::ResourceVector::new();
            for p in pending {
                total.add(&p.requested);
            }
            if !policy.max_pending_resource.covers(&total) {
                return Err(self.violation(format!(
                    "access key {} exceeds its pending resource ceiling",
                    workload.access_key,
                )));
            }
        }
        Ok(())
    }
}

// ── Reserved batch start ───────────────────────────────────────────

/// Batch sessions with a reservation are held back until their start
/// time passes. Other kinds ignore `starts_at`.
pub struct ReservedBatchStart;

impl SchedulingRule for ReservedBatchStart {
    fn name(&self) -> &'static str {
        "reserved_batch_start"
    }

    fn validate(
        &self,
        _snapshot: &SystemSnapshot,
        workload: &SessionWorkload,
    ) -> Result<(), RuleViolation> {
        if workload.kind != SessionKind::Batch {
            return Ok(());
        }
        if let Some(starts_at) = workload.starts_at {
            let now = epoch_secs();
            if starts_at > now {
                return Err(self.violation(format!(
                    "batch session reserved to start at {starts_at} ({}s from now)",
                    starts_at - now,
                )));
            }
        }
        Ok(())
    }
}
