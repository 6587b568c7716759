//! Workload ordering within one scheduling pass.
//!
//! Sequencing happens after the priority cliff: only the highest
//! priority tier present in the queue is considered at all, and the
//! configured sequencer orders that tier. Every sort is stable, so
//! equal keys preserve arrival order.

use sokovan_state::{SessionWorkload, SystemSnapshot};
use std::cmp::Ordering;
use std::str::FromStr;

use crate::error::ScheduleError;

/// Keep only the highest priority tier. Lower tiers wait entirely,
/// even when resources for them are free.
pub fn priority_cliff(workloads: Vec<SessionWorkload>) -> (Option<i32>, Vec<SessionWorkload>) {
    let Some(top) = workloads.iter().map(|w| w.priority).max() else {
        return (None, workloads);
    };
    let tier = workloads.into_iter().filter(|w| w.priority == top).collect();
    (Some(top), tier)
}

/// Ordering policy for the contending tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sequencer {
    /// Arrival order (oldest first).
    #[default]
    Fifo,
    /// Reverse arrival order (newest first).
    Lifo,
    /// Dominant resource fairness: credentials using the smallest
    /// share of their most-contended resource go first.
    Drf,
    /// Externally computed per-(group, user) ranks, ascending.
    /// Workloads without a rank sort last.
    FairShare,
}

impl FromStr for Sequencer {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(Self::Fifo),
            "lifo" => Ok(Self::Lifo),
            "drf" => Ok(Self::Drf),
            "fair_share" | "fair-share" => Ok(Self::FairShare),
            other => Err(ScheduleError::UnknownStrategy(other.to_string())),
        }
    }
}

impl Sequencer {
    /// Order the contending workloads. The input arrives in arrival
    /// order; stable sorts keep that order on ties.
    pub fn sequence(
        self,
        snapshot: &SystemSnapshot,
        mut workloads: Vec<SessionWorkload>,
    ) -> Vec<SessionWorkload> {
        match self {
            Sequencer::Fifo => {}
            Sequencer::Lifo => workloads.reverse(),
            Sequencer::Drf => {
                workloads.sort_by(|a, b| {
                    let sa = snapshot.dominant_share_for(&a.access_key);
                    let sb = snapshot.dominant_share_for(&b.access_key);
                    sa.partial_cmp(&sb).unwrap_or(Ordering::Equal)
                });
            }
            Sequencer::FairShare => {
                workloads.sort_by(|a, b| {
                    let ra = snapshot.fair_share_rank(&a.group_id, &a.user_id);
                    let rb = snapshot.fair_share_rank(&b.group_id, &b.user_id);
                    match (ra, rb) {
                        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                        (Some(_), None) => Ordering::Less,
                        (None, Some(_)) => Ordering::Greater,
                        (None, None) => Ordering::Equal,
                    }
                });
            }
        }
        workloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sokovan_state::{
        ClusterMode, KernelWorkload, QuotaScope, ResourceVector, SessionKind,
    };

    fn workload(id: &str, access_key: &str, priority: i32) -> SessionWorkload {
        SessionWorkload {
            id: id.into(),
            access_key: access_key.into(),
            user_id: format!("u-{access_key}"),
            group_id: "g1".into(),
            domain_id: "d1".into(),
            resource_group: "sg1".into(),
            requested: ResourceVector::new(),
            priority,
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
                requested: ResourceVector::from_pairs([("cpu", 1u64)]),
            }],
        }
    }

    fn ids(workloads: &[SessionWorkload]) -> Vec<&str> {
        workloads.iter().map(|w| w.id.as_str()).collect()
    }

    #[test]
    fn cliff_keeps_only_top_tier() {
        let queue = vec![
            workload("s1", "ak1", 0),
            workload("s2", "ak2", 10),
            workload("s3", "ak3", 10),
            workload("s4", "ak4", 5),
        ];
        let (tier, kept) = priority_cliff(queue);
        assert_eq!(tier, Some(10));
        assert_eq!(ids(&kept), ["s2", "s3"]);
    }

    #[test]
    fn cliff_on_empty_queue() {
        let (tier, kept) = priority_cliff(vec![]);
        assert_eq!(tier, None);
        assert!(kept.is_empty());
    }

    #[test]
    fn fifo_preserves_and_lifo_reverses() {
        let snapshot = SystemSnapshot::default();
        let queue = vec![
            workload("s1", "ak1", 0),
            workload("s2", "ak2", 0),
            workload("s3", "ak3", 0),
        ];
        assert_eq!(
            ids(&Sequencer::Fifo.sequence(&snapshot, queue.clone())),
            ["s1", "s2", "s3"]
        );
        assert_eq!(
            ids(&Sequencer::Lifo.sequence(&snapshot, queue)),
            ["s3", "s2", "s1"]
        );
    }

    #[test]
    fn drf_orders_by_dominant_share_ascending() {
        let mut snapshot = SystemSnapshot {
            total_capacity: ResourceVector::from_pairs([("cpu", 10), ("mem", 100)]),
            ..Default::default()
        };
        // ak1 dominates at 50% cpu; ak2 at 10% mem.
        snapshot.occupancy.insert(
            QuotaScope::AccessKey.key("ak1"),
            ResourceVector::from_pairs([("cpu", 5u64)]),
        );
        snapshot.occupancy.insert(
            QuotaScope::AccessKey.key("ak2"),
            ResourceVector::from_pairs([("mem", 10u64)]),
        );

        let queue = vec![workload("s1", "ak1", 0), workload("s2", "ak2", 0)];
        assert_eq!(ids(&Sequencer::Drf.sequence(&snapshot, queue)), ["s2", "s1"]);
    }

    #[test]
    fn drf_ties_preserve_arrival_order() {
        let snapshot = SystemSnapshot::default();
        let queue = vec![
            workload("s1", "ak1", 0),
            workload("s2", "ak2", 0),
            workload("s3", "ak3", 0),
        ];
        // All shares are zero: stable sort keeps arrival order.
        assert_eq!(
            ids(&Sequencer::Drf.sequence(&snapshot, queue)),
            ["s1", "s2", "s3"]
        );
    }

    #[test]
    fn fair_share_missing_rank_sorts_last() {
        let mut snapshot = SystemSnapshot::default();
        snapshot.fair_share_ranks.insert("g1/u-ak2".into(), 0.2);
        snapshot.fair_share_ranks.insert("g1/u-ak3".into(), 0.1);

        let queue = vec![
            workload("s1", "ak1", 0), // no rank
            workload("s2", "ak2", 0),
            workload("s3", "ak3", 0),
        ];
        assert_eq!(
            ids(&Sequencer::FairShare.sequence(&snapshot, queue)),
            ["s3", "s2", "s1"]
        );
    }

    #[test]
    fn parses_strategy_names() {
        assert_eq!("fifo".parse::<Sequencer>().ok(), Some(Sequencer::Fifo));
        assert_eq!("drf".parse::<Sequencer>().ok(), Some(Sequencer::Drf));
        assert_eq!(
            "fair-share".parse::<Sequencer>().ok(),
            Some(Sequencer::FairShare)
        );
        assert!("rand".parse::<Sequencer>().is_err());
    }
}
