//! Phase handler wiring: adapts the scheduler pipeline and the
//! lifecycle handlers to the coordinator's `PhaseHandler` trait and
//! chains their markers so each phase wakes the next one promptly.

use std::sync::Mutex;

use sokovan_coordinator::{EventBus, HandlerOutcome, Phase, PhaseHandler, SchedulerEvent};
use sokovan_lifecycle::{AgentClient, Launcher, PhaseReport, RetryHandler, Sweeper, Terminator};
use sokovan_scheduler::Provisioner;

fn outcome_of(report: PhaseReport) -> HandlerOutcome {
    HandlerOutcome {
        sessions: report.sessions,
        errors: report.errors,
        cascade: Vec::new(),
    }
}

// ── Scheduling ─────────────────────────────────────────────────────

/// One per resource group: runs the scheduling pass.
pub struct ScheduleHandler {
    resource_group: String,
    // The round-robin selector carries a cursor across passes.
    provisioner: Mutex<Provisioner>,
}

impl ScheduleHandler {
    pub fn new(resource_group: String, provisioner: Provisioner) -> Self {
        Self {
            resource_group,
            provisioner: Mutex::new(provisioner),
        }
    }
}

impl PhaseHandler for ScheduleHandler {
    fn phase(&self) -> Phase {
        Phase::Schedule
    }

    fn lock_id(&self) -> String {
        format!("schedule:{}", self.resource_group)
    }

    async fn execute(&self) -> anyhow::Result<HandlerOutcome> {
        let summary = {
            let mut provisioner = self
                .provisioner
                .lock()
                .map_err(|_| anyhow::anyhow!("provisioner lock poisoned"))?;
            provisioner.pass(&self.resource_group)?
        };
        let mut outcome = HandlerOutcome {
            sessions: summary.scheduled,
            errors: Vec::new(),
            cascade: Vec::new(),
        };
        if !outcome.sessions.is_empty() {
            outcome = outcome.cascade_to(Phase::CheckPrecondition.as_str());
        }
        Ok(outcome)
    }
}

// ── Launch phases ──────────────────────────────────────────────────

pub struct PrecondHandler<C> {
    launcher: Launcher<C>,
}

impl<C: AgentClient> PrecondHandler<C> {
    pub fn new(launcher: Launcher<C>) -> Self {
        Self { launcher }
    }
}

impl<C: AgentClient> PhaseHandler for PrecondHandler<C> {
    fn phase(&self) -> Phase {
        Phase::CheckPrecondition
    }

    fn lock_id(&self) -> String {
        Phase::CheckPrecondition.as_str().to_string()
    }

    async fn execute(&self) -> anyhow::Result<HandlerOutcome> {
        let report = self.launcher.check_precondition().await?;
        let mut outcome = outcome_of(report);
        if !outcome.sessions.is_empty() {
            outcome = outcome.cascade_to(Phase::CheckPullingProgress.as_str());
        }
        Ok(outcome)
    }
}

pub struct PullProgressHandler<C> {
    launcher: Launcher<C>,
}

impl<C: AgentClient> PullProgressHandler<C> {
    pub fn new(launcher: Launcher<C>) -> Self {
        Self { launcher }
    }
}

impl<C: AgentClient> PhaseHandler for PullProgressHandler<C> {
    fn phase(&self) -> Phase {
        Phase::CheckPullingProgress
    }

    fn lock_id(&self) -> String {
        Phase::CheckPullingProgress.as_str().to_string()
    }

    async fn execute(&self) -> anyhow::Result<HandlerOutcome> {
        let report = self.launcher.check_pulling_progress().await?;
        let mut outcome = outcome_of(report);
        if !outcome.sessions.is_empty() {
            outcome = outcome.cascade_to(Phase::Start.as_str());
        }
        Ok(outcome)
    }
}

pub struct StartHandler<C> {
    launcher: Launcher<C>,
}

impl<C: AgentClient> StartHandler<C> {
    pub fn new(launcher: Launcher<C>) -> Self {
        Self { launcher }
    }
}

impl<C: AgentClient> PhaseHandler for StartHandler<C> {
    fn phase(&self) -> Phase {
        Phase::Start
    }

    fn lock_id(&self) -> String {
        Phase::Start.as_str().to_string()
    }

    async fn execute(&self) -> anyhow::Result<HandlerOutcome> {
        let report = self.launcher.start().await?;
        let mut outcome = outcome_of(report);
        if !outcome.sessions.is_empty() {
            outcome = outcome.cascade_to(Phase::CheckCreatingProgress.as_str());
        }
        Ok(outcome)
    }
}

pub struct CreateProgressHandler<C> {
    launcher: Launcher<C>,
}

impl<C: AgentClient> CreateProgressHandler<C> {
    pub fn new(launcher: Launcher<C>) -> Self {
        Self { launcher }
    }
}

impl<C: AgentClient> PhaseHandler for CreateProgressHandler<C> {
    fn phase(&self) -> Phase {
        Phase::CheckCreatingProgress
    }

    fn lock_id(&self) -> String {
        Phase::CheckCreatingProgress.as_str().to_string()
    }

    async fn execute(&self) -> anyhow::Result<HandlerOutcome> {
        Ok(outcome_of(self.launcher.check_creating_progress().await?))
    }
}

// ── Teardown / maintenance ─────────────────────────────────────────

pub struct TerminateProgressHandler<C> {
    terminator: Terminator<C>,
    /// Groups to re-arm once capacity frees up.
    resource_groups: Vec<String>,
}

impl<C: AgentClient> TerminateProgressHandler<C> {
    pub fn new(terminator: Terminator<C>, resource_groups: Vec<String>) -> Self {
        Self {
            terminator,
            resource_groups,
        }
    }
}

impl<C: AgentClient> PhaseHandler for TerminateProgressHandler<C> {
    fn phase(&self) -> Phase {
        Phase::Terminate
    }

    fn lock_id(&self) -> String {
        Phase::Terminate.as_str().to_string()
    }

    async fn execute(&self) -> anyhow::Result<HandlerOutcome> {
        let report = self.terminator.check_terminating_progress().await?;
        let mut outcome = outcome_of(report);
        if !outcome.sessions.is_empty() {
            // Freed capacity may unblock pending workloads.
            for group in &self.resource_groups {
                outcome = outcome.cascade_to(format!("schedule:{group}"));
            }
        }
        Ok(outcome)
    }
}

pub struct RetryPhaseHandler<C> {
    retry: RetryHandler<C>,
    events: EventBus,
}

impl<C: AgentClient> RetryPhaseHandler<C> {
    pub fn new(retry: RetryHandler<C>, events: EventBus) -> Self {
        Self { retry, events }
    }
}

impl<C: AgentClient> PhaseHandler for RetryPhaseHandler<C> {
    fn phase(&self) -> Phase {
        Phase::Retry
    }

    fn lock_id(&self) -> String {
        Phase::Retry.as_str().to_string()
    }

    async fn execute(&self) -> anyhow::Result<HandlerOutcome> {
        let report = self.retry.run().await?;
        for session_id in &report.stuck {
            self.events.publish(SchedulerEvent::SessionStuck {
                session_id: session_id.clone(),
            });
        }
        Ok(outcome_of(report))
    }
}

pub struct SweepHandler {
    sweeper: Sweeper,
}

impl SweepHandler {
    pub fn new(sweeper: Sweeper) -> Self {
        Self { sweeper }
    }
}

impl PhaseHandler for SweepHandler {
    fn phase(&self) -> Phase {
        Phase::Sweep
    }

    fn lock_id(&self) -> String {
        Phase::Sweep.as_str().to_string()
    }

    async fn execute(&self) -> anyhow::Result<HandlerOutcome> {
        let cancelled = self.sweeper.sweep()?;
        Ok(HandlerOutcome {
            sessions: cancelled,
            errors: Vec::new(),
            cascade: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sokovan_coordinator::{Coordinator, EventBus, LocalLockFactory};
    use sokovan_lifecycle::MockAgent;
    use sokovan_scheduler::{SelectionStrategy, Sequencer};
    use sokovan_state::{
        AgentInfo, ClusterMode, KernelWorkload, ResourceVector, SessionKind, SessionStatus,
        SessionStore, SessionWorkload,
    };

    fn seed(store: &SessionStore) {
        store
            .put_agent(&AgentInfo {
                id: "a1".into(),
                address: "10.0.0.1:6001".into(),
                architecture: "x86_64".into(),
                resource_group: "sg1".into(),
                available_slots: ResourceVector::from_pairs([("cpu", 8u64), ("mem", 16)]),
                occupied_slots: ResourceVector::new(),
                container_count: 0,
                max_containers: 0,
                schedulable: true,
            })
            .unwrap();
        store
            .enqueue_session(&SessionWorkload {
                id: "s1".into(),
                access_key: "ak1".into(),
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
                    id: "s1-k1".into(),
                    image: "python:3.12".into(),
                    architecture: "x86_64".into(),
                    requested: ResourceVector::from_pairs([("cpu", 1u64), ("mem", 1)]),
                }],
            })
            .unwrap();
    }

    #[tokio::test]
    async fn phases_cascade_from_schedule_to_running() {
        let store = SessionStore::open_in_memory().unwrap();
        seed(&store);
        let mock = MockAgent::new();
        mock.set_pull_ready(true);
        mock.set_create_ready(true);

        let coordinator = Coordinator::new(
            store.clone(),
            LocalLockFactory::new(),
            EventBus::default(),
        );

        let schedule = ScheduleHandler::new(
            "sg1".into(),
            Provisioner::new(store.clone(), Sequencer::Fifo, SelectionStrategy::Concentrated),
        );
        let precond = PrecondHandler::new(Launcher::new(store.clone(), mock.clone()));
        let pulling = PullProgressHandler::new(Launcher::new(store.clone(), mock.clone()));
        let start = StartHandler::new(Launcher::new(store.clone(), mock.clone()));
        let creating = CreateProgressHandler::new(Launcher::new(store.clone(), mock.clone()));

        // Force the first phase; every following phase wakes off its
        // predecessor's cascade marker alone.
        assert!(coordinator.run_cycle(&schedule, true).await.unwrap());
        assert!(coordinator.run_cycle(&precond, false).await.unwrap());
        assert!(coordinator.run_cycle(&pulling, false).await.unwrap());
        assert!(coordinator.run_cycle(&start, false).await.unwrap());
        assert!(coordinator.run_cycle(&creating, false).await.unwrap());

        let row = store.get_session("s1").unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn terminate_handler_rearms_scheduling() {
        let store = SessionStore::open_in_memory().unwrap();
        seed(&store);
        let mock = MockAgent::new();
        mock.set_pull_ready(true);
        mock.set_create_ready(true);

        let coordinator = Coordinator::new(
            store.clone(),
            LocalLockFactory::new(),
            EventBus::default(),
        );
        let schedule = ScheduleHandler::new(
            "sg1".into(),
            Provisioner::new(store.clone(), Sequencer::Fifo, SelectionStrategy::Concentrated),
        );
        coordinator.run_cycle(&schedule, true).await.unwrap();

        let terminator = Terminator::new(store.clone(), mock.clone());
        terminator.terminate(&["s1".into()], "test").await.unwrap();

        let handler = TerminateProgressHandler::new(
            Terminator::new(store.clone(), mock),
            vec!["sg1".into()],
        );
        coordinator.run_cycle(&handler, true).await.unwrap();

        let row = store.get_session("s1").unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Terminated);
        assert!(store.load_and_clear("schedule:sg1").unwrap());
    }
}
