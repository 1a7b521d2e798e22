//! The seam between the provider and the two instance-materializing backends

use crate::docker::DockerBackend;
use crate::fork::{ForkBackend, ForkedAgent};
use std::path::PathBuf;
use tokio::sync::watch;

/// Everything a backend needs to materialize one instance
pub struct StartContext {
    pub name: String,
    pub instance_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Host port the instance must end up listening on
    pub port: u16,
    /// Plaintext secret captured at login for the stdin handoff, when available
    pub credentials: Option<HandoffCredentials>,
}

/// Credentials passed to a freshly started instance over a side channel,
/// never via process arguments.
#[derive(Clone)]
pub struct HandoffCredentials {
    pub user: String,
    pub password: String,
}

impl HandoffCredentials {
    /// One JSON line, the wire format both backends write to agent stdin
    pub fn to_json_line(&self) -> String {
        let mut payload = serde_json::json!({
            "user": self.user,
            "password": self.password,
        })
        .to_string();
        payload.push('\n');
        payload
    }
}

/// Handle to one live instance (an OS process or a container)
pub enum InstanceHandle {
    Fork(ForkedAgent),
    Docker {
        container_id: String,
        port: u16,
        /// Sender that stops the container log streaming task
        log_shutdown: Option<watch::Sender<bool>>,
    },
}

impl InstanceHandle {
    /// Host port the instance is bound to
    pub fn port(&self) -> u16 {
        match self {
            InstanceHandle::Fork(agent) => agent.port,
            InstanceHandle::Docker { port, .. } => *port,
        }
    }

    /// Cheap owned token for measuring the instance's memory later,
    /// without keeping a borrow of the handle alive across awaits.
    pub fn memory_probe(&self) -> MemoryProbe {
        match self {
            InstanceHandle::Fork(agent) => MemoryProbe::Process(agent.pid()),
            InstanceHandle::Docker { container_id, .. } => {
                MemoryProbe::Container(container_id.clone())
            }
        }
    }
}

/// What to measure when sampling one instance's resident memory
pub enum MemoryProbe {
    Process(Option<u32>),
    Container(String),
}

/// The closed set of backend variants; the provider holds exactly one,
/// chosen at construction.
pub enum Backend {
    Fork(ForkBackend),
    Docker(DockerBackend),
}

impl Backend {
    /// One-time backend setup run in the background at process startup
    pub async fn initialize(&self) -> anyhow::Result<()> {
        match self {
            Backend::Fork(fork) => fork.initialize().await,
            Backend::Docker(docker) => docker.initialize().await,
        }
    }

    /// Materialize an instance bound to the context's port
    pub async fn start(&self, ctx: &StartContext) -> anyhow::Result<InstanceHandle> {
        match self {
            Backend::Fork(fork) => fork.start(ctx).await.map(InstanceHandle::Fork),
            Backend::Docker(docker) => docker.start(ctx).await,
        }
    }

    /// Terminate the instance behind a handle, gracefully where possible
    pub async fn stop(&self, name: &str, handle: InstanceHandle) -> anyhow::Result<()> {
        match (self, handle) {
            (Backend::Fork(fork), InstanceHandle::Fork(agent)) => fork.stop(name, agent).await,
            (
                Backend::Docker(docker),
                InstanceHandle::Docker {
                    container_id,
                    log_shutdown,
                    ..
                },
            ) => {
                if let Some(shutdown) = log_shutdown {
                    let _ = shutdown.send(true);
                }
                docker.stop(name, &container_id).await
            }
            // A handle always belongs to the backend that created it
            _ => anyhow::bail!("instance handle does not match backend variant"),
        }
    }

    /// Resident memory of the instance in bytes; 0 when it cannot be observed
    pub async fn memory_usage(&self, probe: &MemoryProbe) -> u64 {
        match (self, probe) {
            (Backend::Fork(_), MemoryProbe::Process(pid)) => {
                pid.map(crate::fork::rss_bytes).unwrap_or(0)
            }
            (Backend::Docker(docker), MemoryProbe::Container(container_id)) => {
                docker.memory_usage(container_id).await
            }
            _ => 0,
        }
    }
}
