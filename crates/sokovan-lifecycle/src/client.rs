//! Agent RPC surface.
//!
//! The lifecycle handlers talk to agents through [`AgentClient`], a
//! clonable async trait. Callers fan calls out per agent with a
//! `JoinSet` and capture errors per call; the [`MockAgent`] double
//! scripts failures and readiness for tests.

use sokovan_state::{AgentId, KernelId, KernelRow, LaunchInfo, SessionId};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// One agent RPC failure, surfaced per call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("agent rpc failed: {0}")]
pub struct AgentError(pub String);

pub type AgentResult<T> = Result<T, AgentError>;

/// Where to reach one agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentEndpoint {
    pub id: AgentId,
    pub address: String,
}

impl AgentEndpoint {
    /// Endpoint of a kernel's assigned agent, if it has one.
    pub fn of_kernel(row: &KernelRow) -> Option<Self> {
        Some(Self {
            id: row.agent_id.clone()?,
            address: row.agent_address.clone().unwrap_or_default(),
        })
    }
}

/// An image an agent must have locally before kernels can start.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub image: String,
    pub architecture: String,
}

/// Cluster-wide material shared by every kernel of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub network_name: String,
    pub size: u32,
    pub ssh_public_key: String,
    pub ssh_private_key: String,
}

impl ClusterInfo {
    /// Wire form of the launch material persisted on the session row.
    pub fn of_launch(launch: &LaunchInfo) -> Self {
        Self {
            network_name: launch.network_name.clone(),
            size: launch.cluster_size,
            ssh_public_key: launch.ssh_public_key.clone(),
            ssh_private_key: launch.ssh_private_key.clone(),
        }
    }
}

/// Everything an agent needs to create one kernel container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCreationSpec {
    pub kernel_id: KernelId,
    pub image: String,
    pub host_port: u16,
    pub cluster: ClusterInfo,
    pub env: BTreeMap<String, String>,
}

/// Async RPC client for one agent fleet. Implementations must be
/// cheaply clonable; fan-out spawns one task per agent.
pub trait AgentClient: Clone + Send + Sync + 'static {
    /// Ensure the images are present on the agent, pulling as needed.
    fn check_and_pull(
        &self,
        agent: AgentEndpoint,
        images: Vec<ImageRef>,
    ) -> impl Future<Output = AgentResult<()>> + Send;

    /// Create the session's kernels hosted by this agent.
    fn create_kernels(
        &self,
        agent: AgentEndpoint,
        session_id: SessionId,
        specs: Vec<KernelCreationSpec>,
    ) -> impl Future<Output = AgentResult<()>> + Send;

    /// Tear one kernel down.
    fn destroy_kernel(
        &self,
        agent: AgentEndpoint,
        session_id: SessionId,
        kernel_id: KernelId,
        reason: String,
    ) -> impl Future<Output = AgentResult<()>> + Send;

    /// True once the kernel's image is ready on the agent.
    fn check_pulling(
        &self,
        agent: AgentEndpoint,
        kernel_id: KernelId,
    ) -> impl Future<Output = AgentResult<bool>> + Send;

    /// True once the kernel's container is up.
    fn check_creating(
        &self,
        agent: AgentEndpoint,
        kernel_id: KernelId,
    ) -> impl Future<Output = AgentResult<bool>> + Send;

    /// True while the kernel's container is still alive.
    fn check_running(
        &self,
        agent: AgentEndpoint,
        kernel_id: KernelId,
    ) -> impl Future<Output = AgentResult<bool>> + Send;

    /// Reserve a host port on the agent.
    fn assign_port(&self, agent: AgentEndpoint) -> impl Future<Output = AgentResult<u16>> + Send;

    /// Create the session-scoped container network on the agent.
    fn create_local_network(
        &self,
        agent: AgentEndpoint,
        name: String,
    ) -> impl Future<Output = AgentResult<()>> + Send;
}

// ── Test double ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MockInner {
    calls: Vec<String>,
    /// Ops scripted to fail, keyed `op` or `op:agent`.
    fail: HashSet<String>,
    pull_ready: bool,
    create_ready: bool,
    /// Kernels whose containers are currently alive.
    running: HashSet<KernelId>,
    /// Specs seen by `create_kernels`, in call order.
    created: Vec<KernelCreationSpec>,
    next_port: u16,
}

/// Scriptable in-memory agent fleet used by lifecycle tests and the
/// standalone daemon's dry-run mode.
#[derive(Debug, Clone)]
pub struct MockAgent {
    inner: Arc<Mutex<MockInner>>,
}

impl Default for MockAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAgent {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner {
                next_port: 30000,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Script `op` (optionally only on `agent`) to fail.
    pub fn fail_op(&self, op: &str) {
        self.lock().fail.insert(op.to_string());
    }

    pub fn fail_on(&self, op: &str, agent: &str) {
        self.lock().fail.insert(format!("{op}:{agent}"));
    }

    pub fn set_pull_ready(&self, ready: bool) {
        self.lock().pull_ready = ready;
    }

    pub fn set_create_ready(&self, ready: bool) {
        self.lock().create_ready = ready;
    }

    pub fn set_running(&self, kernel_id: &str, running: bool) {
        let mut inner = self.lock();
        if running {
            inner.running.insert(kernel_id.to_string());
        } else {
            inner.running.remove(kernel_id);
        }
    }

    /// Recorded calls as `op:agent[:detail]`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Every spec handed to `create_kernels`, in call order.
    pub fn created_specs(&self) -> Vec<KernelCreationSpec> {
        self.lock().created.clone()
    }

    pub fn calls_of(&self, op: &str) -> Vec<String> {
        let prefix = format!("{op}:");
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn record(&self, op: &str, agent: &AgentEndpoint, detail: &str) -> AgentResult<()> {
        let mut inner = self.lock();
        if detail.is_empty() {
            inner.calls.push(format!("{op}:{}", agent.id));
        } else {
            inner.calls.push(format!("{op}:{}:{detail}", agent.id));
        }
        if inner.fail.contains(op) || inner.fail.contains(&format!("{op}:{}", agent.id)) {
            return Err(AgentError(format!("{op} scripted to fail on {}", agent.id)));
        }
        Ok(())
    }
}

impl AgentClient for MockAgent {
    async fn check_and_pull(
        &self,
        agent: AgentEndpoint,
        images: Vec<ImageRef>,
    ) -> AgentResult<()> {
        self.record("check_and_pull", &agent, &images.len().to_string())
    }

    async fn create_kernels(
        &self,
        agent: AgentEndpoint,
        session_id: SessionId,
        specs: Vec<KernelCreationSpec>,
    ) -> AgentResult<()> {
        self.record("create_kernels", &agent, &session_id)?;
        let mut inner = self.lock();
        for spec in specs {
            inner.running.insert(spec.kernel_id.clone());
            inner.created.push(spec);
        }
        Ok(())
    }

    async fn destroy_kernel(
        &self,
        agent: AgentEndpoint,
        _session_id: SessionId,
        kernel_id: KernelId,
        _reason: String,
    ) -> AgentResult<()> {
        self.record("destroy_kernel", &agent, &kernel_id)?;
        self.lock().running.remove(&kernel_id);
        Ok(())
    }

    async fn check_pulling(&self, agent: AgentEndpoint, kernel_id: KernelId) -> AgentResult<bool> {
        self.record("check_pulling", &agent, &kernel_id)?;
        Ok(self.lock().pull_ready)
    }

    async fn check_creating(&self, agent: AgentEndpoint, kernel_id: KernelId) -> AgentResult<bool> {
        self.record("check_creating", &agent, &kernel_id)?;
        Ok(self.lock().create_ready)
    }

    async fn check_running(&self, agent: AgentEndpoint, kernel_id: KernelId) -> AgentResult<bool> {
        self.record("check_running", &agent, &kernel_id)?;
        Ok(self.lock().running.contains(&kernel_id))
    }

    async fn assign_port(&self, agent: AgentEndpoint) -> AgentResult<u16> {
        self.record("assign_port", &agent, "")?;
        let mut inner = self.lock();
        inner.next_port += 1;
        Ok(inner.next_port)
    }

    async fn create_local_network(&self, agent: AgentEndpoint, name: String) -> AgentResult<()> {
        self.record("create_local_network", &agent, &name)
    }
}
