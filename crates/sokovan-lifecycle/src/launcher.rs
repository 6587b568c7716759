//! Launch-side phase handlers: Scheduled → Preparing/Pulling →
//! Prepared → Creating → Running.
//!
//! Each handler scans for sessions in its source phase, advances the
//! rows through guarded transitions, and fans agent RPCs out with a
//! `JoinSet`, one task per agent. RPC failures are captured per call
//! in the [`PhaseReport`]; the session stays in phase for the retry
//! handler rather than aborting the scan.

use rand::distr::Alphanumeric;
use rand::Rng;
use sokovan_state::{AgentId, KernelRow, LaunchInfo, SessionId, SessionStatus, SessionStore};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::client::{
    AgentClient, AgentEndpoint, AgentResult, ClusterInfo, ImageRef, KernelCreationSpec,
};
use crate::error::LifecycleResult;

/// What one phase scan did: sessions advanced plus captured RPC errors.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub sessions: Vec<SessionId>,
    pub errors: Vec<String>,
    /// Sessions flagged stuck during this scan (retry handler only).
    pub stuck: Vec<SessionId>,
}

impl PhaseReport {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.errors.is_empty() && self.stuck.is_empty()
    }
}

/// Group kernel rows by their assigned agent. Unassigned kernels are
/// dropped; they cannot be reached anyway.
pub(crate) fn by_agent(kernels: &[KernelRow]) -> HashMap<AgentEndpoint, Vec<KernelRow>> {
    let mut groups: HashMap<AgentEndpoint, Vec<KernelRow>> = HashMap::new();
    for kernel in kernels {
        if let Some(endpoint) = AgentEndpoint::of_kernel(kernel) {
            groups.entry(endpoint).or_default().push(kernel.clone());
        }
    }
    groups
}

pub(crate) async fn drain_fanout(
    set: &mut JoinSet<(AgentId, AgentResult<()>)>,
    session_id: &str,
    report: &mut PhaseReport,
) {
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((agent, Err(err))) => {
                warn!(%session_id, %agent, %err, "agent call failed");
                report.errors.push(format!("{session_id}/{agent}: {err}"));
            }
            Err(err) => report.errors.push(format!("{session_id}: join: {err}")),
        }
    }
}

fn session_env(session_id: &str, cluster_size: u32) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("SOKOVAN_SESSION_ID".to_string(), session_id.to_string()),
        ("SOKOVAN_CLUSTER_SIZE".to_string(), cluster_size.to_string()),
    ])
}

/// Placeholder cluster SSH material; agents install it into the
/// kernels so multi-node sessions can reach their peers.
fn generate_ssh_material() -> (String, String) {
    let mut rng = rand::rng();
    let private: String = (&mut rng)
        .sample_iter(Alphanumeric)
        .take(64)
        .map(char::from)
        .collect();
    let public: String = (&mut rng)
        .sample_iter(Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    (public, private)
}

/// Drives sessions from Scheduled to Running.
pub struct Launcher<C> {
    store: SessionStore,
    client: C,
    start_timeout: Duration,
}

impl<C: AgentClient> Launcher<C> {
    pub fn new(store: SessionStore, client: C) -> Self {
        Self {
            store,
            client,
            start_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Scheduled → Preparing: trigger image pulls, grouped per agent.
    pub async fn check_precondition(&self) -> LifecycleResult<PhaseReport> {
        let mut report = PhaseReport::default();
        let rows = self
            .store
            .list_sessions_by_status(&[SessionStatus::Scheduled], None)?;
        for row in rows {
            if row.stuck {
                continue;
            }
            let id = row.workload.id.clone();
            let moved = self.store.transition_sessions(
                &[id.clone()],
                &[SessionStatus::Scheduled],
                SessionStatus::Preparing,
            )?;
            if moved.is_empty() {
                continue;
            }
            self.store.transition_kernels(&id, SessionStatus::Preparing)?;

            let kernels = self.store.kernels_for_session(&id)?;
            let mut set = JoinSet::new();
            for (endpoint, group) in by_agent(&kernels) {
                let images: Vec<ImageRef> = group
                    .iter()
                    .map(|k| ImageRef {
                        image: k.kernel.image.clone(),
                        architecture: k.kernel.architecture.clone(),
                    })
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                let client = self.client.clone();
                set.spawn(async move {
                    let agent = endpoint.id.clone();
                    (agent, client.check_and_pull(endpoint, images).await)
                });
            }
            drain_fanout(&mut set, &id, &mut report).await;

            info!(session_id = %id, "image pulls triggered");
            report.sessions.push(id);
        }
        Ok(report)
    }

    /// Preparing/Pulling → Prepared once every kernel's image is ready.
    pub async fn check_pulling_progress(&self) -> LifecycleResult<PhaseReport> {
        let mut report = PhaseReport::default();
        let rows = self
            .store
            .list_sessions_by_status(&[SessionStatus::Preparing, SessionStatus::Pulling], None)?;
        for row in rows {
            if row.stuck {
                continue;
            }
            let id = row.workload.id.clone();
            let kernels = self.store.kernels_for_session(&id)?;

            let mut all_ready = !kernels.is_empty();
            let mut ready = HashSet::new();
            for kernel in &kernels {
                let Some(endpoint) = AgentEndpoint::of_kernel(kernel) else {
                    all_ready = false;
                    continue;
                };
                match self
                    .client
                    .check_pulling(endpoint, kernel.kernel.id.clone())
                    .await
                {
                    Ok(true) => {
                        ready.insert(kernel.kernel.id.clone());
                        if kernel.status != SessionStatus::Prepared {
                            self.store.set_kernel_status(
                                &id,
                                &kernel.kernel.id,
                                SessionStatus::Prepared,
                            )?;
                        }
                    }
                    Ok(false) => all_ready = false,
                    Err(err) => {
                        all_ready = false;
                        warn!(session_id = %id, %err, "pull progress check failed");
                        report.errors.push(format!("{id}: {err}"));
                    }
                }
            }

            if all_ready {
                self.store.transition_sessions(
                    &[id.clone()],
                    &[SessionStatus::Preparing, SessionStatus::Pulling],
                    SessionStatus::Prepared,
                )?;
                info!(session_id = %id, "images ready");
                report.sessions.push(id);
            } else if row.status == SessionStatus::Preparing {
                // At least one pull is still in flight; kernels that
                // already turned ready keep their Prepared status.
                self.store.transition_sessions(
                    &[id.clone()],
                    &[SessionStatus::Preparing],
                    SessionStatus::Pulling,
                )?;
                for kernel in &kernels {
                    if !ready.contains(&kernel.kernel.id) {
                        self.store.set_kernel_status(
                            &id,
                            &kernel.kernel.id,
                            SessionStatus::Pulling,
                        )?;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Prepared → Creating: build creation payloads and fan them out
    /// under a bounded per-session timeout.
    pub async fn start(&self) -> LifecycleResult<PhaseReport> {
        let mut report = PhaseReport::default();
        let rows = self
            .store
            .list_sessions_by_status(&[SessionStatus::Prepared], None)?;
        for row in rows {
            if row.stuck {
                continue;
            }
            let id = row.workload.id.clone();
            let moved = self.store.transition_sessions(
                &[id.clone()],
                &[SessionStatus::Prepared],
                SessionStatus::Creating,
            )?;
            if moved.is_empty() {
                continue;
            }
            self.store.transition_kernels(&id, SessionStatus::Creating)?;

            let kernels = self.store.kernels_for_session(&id)?;
            let (ssh_public_key, ssh_private_key) = generate_ssh_material();
            let cluster_size = kernels.len() as u32;
            let launch = LaunchInfo {
                network_name: format!("sokovan-net-{id}"),
                cluster_size,
                ssh_public_key,
                ssh_private_key,
                env: session_env(&id, cluster_size),
            };
            // Persist before the fan-out: retries of this phase must
            // re-issue the same material the agents already saw.
            self.store.set_launch_info(&id, &launch)?;
            let cluster = ClusterInfo::of_launch(&launch);

            let mut set = JoinSet::new();
            for (endpoint, group) in by_agent(&kernels) {
                let client = self.client.clone();
                let session_id = id.clone();
                let cluster = cluster.clone();
                let env = launch.env.clone();
                set.spawn(async move {
                    let agent = endpoint.id.clone();
                    let result = async {
                        if cluster.size > 1 {
                            client
                                .create_local_network(
                                    endpoint.clone(),
                                    cluster.network_name.clone(),
                                )
                                .await?;
                        }
                        let mut specs = Vec::with_capacity(group.len());
                        for kernel in &group {
                            let port = client.assign_port(endpoint.clone()).await?;
                            specs.push(KernelCreationSpec {
                                kernel_id: kernel.kernel.id.clone(),
                                image: kernel.kernel.image.clone(),
                                host_port: port,
                                cluster: cluster.clone(),
                                env: env.clone(),
                            });
                        }
                        client.create_kernels(endpoint, session_id, specs).await
                    }
                    .await;
                    (agent, result)
                });
            }

            let bounded =
                tokio::time::timeout(self.start_timeout, drain_fanout(&mut set, &id, &mut report))
                    .await;
            if bounded.is_err() {
                // Session stays in Creating; the retry handler owns it now.
                set.abort_all();
                warn!(session_id = %id, "kernel creation timed out");
                report.errors.push(format!("{id}: kernel creation timed out"));
                continue;
            }

            info!(session_id = %id, kernels = kernels.len(), "kernel creation triggered");
            report.sessions.push(id);
        }
        Ok(report)
    }

    /// Creating → Running once every kernel's container is up.
    pub async fn check_creating_progress(&self) -> LifecycleResult<PhaseReport> {
        let mut report = PhaseReport::default();
        let rows = self
            .store
            .list_sessions_by_status(&[SessionStatus::Creating], None)?;
        for row in rows {
            if row.stuck {
                continue;
            }
            let id = row.workload.id.clone();
            let kernels = self.store.kernels_for_session(&id)?;

            let mut all_ready = !kernels.is_empty();
            for kernel in &kernels {
                let Some(endpoint) = AgentEndpoint::of_kernel(kernel) else {
                    all_ready = false;
                    continue;
                };
                match self
                    .client
                    .check_creating(endpoint, kernel.kernel.id.clone())
                    .await
                {
                    Ok(true) => {
                        if kernel.status != SessionStatus::Running {
                            self.store.set_kernel_status(
                                &id,
                                &kernel.kernel.id,
                                SessionStatus::Running,
                            )?;
                        }
                    }
                    Ok(false) => all_ready = false,
                    Err(err) => {
                        all_ready = false;
                        warn!(session_id = %id, %err, "creation progress check failed");
                        report.errors.push(format!("{id}: {err}"));
                    }
                }
            }

            if all_ready {
                self.store.transition_sessions(
                    &[id.clone()],
                    &[SessionStatus::Creating],
                    SessionStatus::Running,
                )?;
                info!(session_id = %id, "session running");
                report.sessions.push(id);
            }
        }
        Ok(report)
    }
}
