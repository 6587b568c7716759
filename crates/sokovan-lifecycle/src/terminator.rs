//! Teardown-side phase handlers: Terminating → Terminated.

use sokovan_state::{SessionId, SessionResult, SessionStatus, SessionStore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::client::{AgentClient, AgentEndpoint};
use crate::error::LifecycleResult;
use crate::launcher::{by_agent, drain_fanout, PhaseReport};

/// Drives sessions out of the cluster and hands their occupancy back.
pub struct Terminator<C> {
    store: SessionStore,
    client: C,
}

impl<C: AgentClient> Terminator<C> {
    pub fn new(store: SessionStore, client: C) -> Self {
        Self { store, client }
    }

    /// Request termination. Pending sessions cancel outright (nothing
    /// to destroy); allocated ones move to Terminating and get their
    /// kernels destroyed, fanned out per agent.
    pub async fn terminate(
        &self,
        session_ids: &[SessionId],
        reason: &str,
    ) -> LifecycleResult<PhaseReport> {
        let mut report = PhaseReport::default();
        let affected = self.store.mark_for_termination(session_ids)?;
        for id in affected {
            let Some(row) = self.store.get_session(&id)? else {
                continue;
            };
            if row.status == SessionStatus::Cancelled {
                info!(session_id = %id, reason, "pending session cancelled");
                report.sessions.push(id);
                continue;
            }

            let kernels = self.store.kernels_for_session(&id)?;
            let mut set = JoinSet::new();
            for (endpoint, group) in by_agent(&kernels) {
                let client = self.client.clone();
                let session_id = id.clone();
                let reason = reason.to_string();
                set.spawn(async move {
                    let agent = endpoint.id.clone();
                    let mut result = Ok(());
                    for kernel in group {
                        if let Err(err) = client
                            .destroy_kernel(
                                endpoint.clone(),
                                session_id.clone(),
                                kernel.kernel.id.clone(),
                                reason.clone(),
                            )
                            .await
                        {
                            result = Err(err);
                        }
                    }
                    (agent, result)
                });
            }
            drain_fanout(&mut set, &id, &mut report).await;

            info!(session_id = %id, reason, "termination triggered");
            report.sessions.push(id);
        }
        Ok(report)
    }

    /// Terminating → Terminated once every kernel confirms it is gone.
    /// Occupancy is released exactly once here.
    pub async fn check_terminating_progress(&self) -> LifecycleResult<PhaseReport> {
        let mut report = PhaseReport::default();
        let rows = self
            .store
            .list_sessions_by_status(&[SessionStatus::Terminating], None)?;
        for row in rows {
            if row.stuck {
                continue;
            }
            let id = row.workload.id.clone();
            let kernels = self.store.kernels_for_session(&id)?;

            let mut all_gone = true;
            for kernel in &kernels {
                let Some(endpoint) = AgentEndpoint::of_kernel(kernel) else {
                    continue;
                };
                match self
                    .client
                    .check_running(endpoint, kernel.kernel.id.clone())
                    .await
                {
                    Ok(false) => {}
                    Ok(true) => all_gone = false,
                    Err(err) => {
                        // Unreachable agent: assume alive, retry later.
                        all_gone = false;
                        warn!(session_id = %id, %err, "termination check failed");
                        report.errors.push(format!("{id}: {err}"));
                    }
                }
            }

            if all_gone {
                self.store.transition_sessions(
                    &[id.clone()],
                    &[SessionStatus::Terminating],
                    SessionStatus::Terminated,
                )?;
                self.store.transition_kernels(&id, SessionStatus::Terminated)?;
                if row.result == SessionResult::Unknown {
                    self.store.set_session_result(&id, SessionResult::Success)?;
                }
                self.store.release_occupancy(&id)?;
                info!(session_id = %id, "session terminated");
                report.sessions.push(id);
            }
        }
        Ok(report)
    }
}
