//! Stuck-session retry.
//!
//! Sessions whose status has not moved past the staleness threshold
//! get their phase RPCs re-issued, up to a retry ceiling. Past the
//! ceiling the session is flagged stuck and left in place for an
//! operator (`SessionStore::clear_stuck` resumes it).

use sokovan_state::{KernelRow, SessionRow, SessionStatus, SessionStore};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

use crate::client::{AgentClient, AgentEndpoint, ClusterInfo, ImageRef, KernelCreationSpec};
use crate::epoch_secs;
use crate::error::LifecycleResult;
use crate::launcher::{by_agent, PhaseReport};

/// Phases the retry handler watches over.
const WATCHED: [SessionStatus; 4] = [
    SessionStatus::Preparing,
    SessionStatus::Pulling,
    SessionStatus::Creating,
    SessionStatus::Terminating,
];

pub struct RetryHandler<C> {
    store: SessionStore,
    client: C,
    staleness: Duration,
    max_retries: u32,
}

impl<C: AgentClient> RetryHandler<C> {
    pub fn new(store: SessionStore, client: C, staleness: Duration, max_retries: u32) -> Self {
        Self {
            store,
            client,
            staleness,
            max_retries,
        }
    }

    /// One retry sweep over every watched phase.
    pub async fn run(&self) -> LifecycleResult<PhaseReport> {
        let mut report = PhaseReport::default();
        let now = epoch_secs();
        let rows = self.store.list_sessions_by_status(&WATCHED, None)?;
        for row in rows {
            if row.stuck {
                continue;
            }
            if now.saturating_sub(row.status_changed_at) < self.staleness.as_secs() {
                continue;
            }
            let id = row.workload.id.clone();
            let kernels = self.store.kernels_for_session(&id)?;

            // Something is still moving: the progress handlers own it.
            if self.phase_settling(&row, &kernels).await {
                continue;
            }

            if row.retries >= self.max_retries {
                warn!(session_id = %id, retries = row.retries, "retry ceiling hit, marking stuck");
                self.store.mark_stuck(&id)?;
                report.stuck.push(id);
                continue;
            }

            self.retrigger(&row, &kernels, &mut report).await;
            let retries = self.store.bump_retries(&id)?;
            info!(session_id = %id, retries, status = ?row.status, "phase retried");
            report.sessions.push(id);
        }
        Ok(report)
    }

    /// Probe the phase's readiness checks; true when every kernel
    /// already reports the state the progress handler is waiting for.
    async fn phase_settling(&self, row: &SessionRow, kernels: &[KernelRow]) -> bool {
        if kernels.is_empty() {
            return false;
        }
        for kernel in kernels {
            let Some(endpoint) = AgentEndpoint::of_kernel(kernel) else {
                return false;
            };
            let kernel_id = kernel.kernel.id.clone();
            let settled = match row.status {
                SessionStatus::Preparing | SessionStatus::Pulling => {
                    self.client.check_pulling(endpoint, kernel_id).await
                }
                SessionStatus::Creating => self.client.check_creating(endpoint, kernel_id).await,
                SessionStatus::Terminating => self
                    .client
                    .check_running(endpoint, kernel_id)
                    .await
                    .map(|alive| !alive),
                _ => return false,
            };
            if !settled.unwrap_or(false) {
                return false;
            }
        }
        true
    }

    /// Re-issue the RPCs of the session's current phase.
    async fn retrigger(&self, row: &SessionRow, kernels: &[KernelRow], report: &mut PhaseReport) {
        let session_id = &row.workload.id;
        match row.status {
            SessionStatus::Preparing | SessionStatus::Pulling => {
                for (endpoint, group) in by_agent(kernels) {
                    let images: Vec<ImageRef> = group
                        .iter()
                        .map(|k| ImageRef {
                            image: k.kernel.image.clone(),
                            architecture: k.kernel.architecture.clone(),
                        })
                        .collect::<HashSet<_>>()
                        .into_iter()
                        .collect();
                    if let Err(err) = self.client.check_and_pull(endpoint.clone(), images).await {
                        report.errors.push(format!("{session_id}/{}: {err}", endpoint.id));
                    }
                }
            }
            SessionStatus::Creating => {
                // Re-issue the payload persisted at start time, not a
                // fresh one: the agents must see the same network
                // name, SSH material, and env on every attempt.
                let Some(launch) = &row.launch else {
                    report
                        .errors
                        .push(format!("{session_id}: launch payload missing"));
                    return;
                };
                let cluster = ClusterInfo::of_launch(launch);
                for (endpoint, group) in by_agent(kernels) {
                    if cluster.size > 1 {
                        if let Err(err) = self
                            .client
                            .create_local_network(endpoint.clone(), cluster.network_name.clone())
                            .await
                        {
                            report
                                .errors
                                .push(format!("{session_id}/{}: {err}", endpoint.id));
                            continue;
                        }
                    }
                    let mut specs = Vec::with_capacity(group.len());
                    for kernel in &group {
                        let port = match self.client.assign_port(endpoint.clone()).await {
                            Ok(port) => port,
                            Err(err) => {
                                report
                                    .errors
                                    .push(format!("{session_id}/{}: {err}", endpoint.id));
                                continue;
                            }
                        };
                        specs.push(KernelCreationSpec {
                            kernel_id: kernel.kernel.id.clone(),
                            image: kernel.kernel.image.clone(),
                            host_port: port,
                            cluster: cluster.clone(),
                            env: launch.env.clone(),
                        });
                    }
                    if let Err(err) = self
                        .client
                        .create_kernels(endpoint.clone(), session_id.clone(), specs)
                        .await
                    {
                        report.errors.push(format!("{session_id}/{}: {err}", endpoint.id));
                    }
                }
            }
            SessionStatus::Terminating => {
                for kernel in kernels {
                    let Some(endpoint) = AgentEndpoint::of_kernel(kernel) else {
                        continue;
                    };
                    if let Err(err) = self
                        .client
                        .destroy_kernel(
                            endpoint,
                            session_id.clone(),
                            kernel.kernel.id.clone(),
                            "retry".to_string(),
                        )
                        .await
                    {
                        report.errors.push(format!("{session_id}: {err}"));
                    }
                }
            }
            _ => {}
        }
    }
}
