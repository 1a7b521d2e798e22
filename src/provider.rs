//! The provider: owns instance identities, runtime state and lifecycle rules

use crate::auth::CredentialRecord;
use crate::backend::{Backend, HandoffCredentials, InstanceHandle, MemoryProbe, StartContext};
use crate::error::ProviderError;
use crate::ports::PortAllocator;
use crate::registry::InstanceRegistry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Running,
    Stopped,
}

/// Public view of one instance as reported by the control API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub state: AgentState,
    /// Loopback URI of the live instance, absent while stopped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Runtime details for a running instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMemoryUsage {
    pub name: String,
    pub memory_usage: u64,
}

/// Aggregate memory report across all running instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total_usage: u64,
    pub average_usage: u64,
    pub agents: Vec<AgentMemoryUsage>,
}

/// Orchestrates agent instances on top of one backend.
///
/// Identity lives in the registry, runtime state in the `running` map. Every
/// operation is rejected with `Initializing` until the one-time background
/// initialization has completed.
pub struct Provider {
    registry: InstanceRegistry,
    backend: Backend,
    ports: PortAllocator,
    running: DashMap<String, InstanceHandle>,
    /// Names with a start in flight, reserved before any backend work
    starting: Mutex<HashSet<String>>,
    /// Plaintext credentials captured by `authenticate`, consumed by the
    /// next `start` for the stdin handoff
    pending_credentials: Mutex<HashMap<String, HandoffCredentials>>,
    /// Host memory sampler consulted by admission control
    free_memory: fn() -> u64,
    initialized: AtomicBool,
}

impl Provider {
    pub fn new(registry: InstanceRegistry, backend: Backend) -> Self {
        Self {
            registry,
            backend,
            ports: PortAllocator::new(),
            running: DashMap::new(),
            starting: Mutex::new(HashSet::new()),
            pending_credentials: Mutex::new(HashMap::new()),
            free_memory: crate::fork::free_system_memory,
            initialized: AtomicBool::new(false),
        }
    }

    /// Run the backend's one-time setup and open the provider for requests.
    ///
    /// Meant to run in a background task so the servers can come up and
    /// answer 503 while a slow image pull or build is in flight.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        self.backend.initialize().await?;
        self.initialized.store(true, Ordering::SeqCst);
        info!("Provider initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> Result<(), ProviderError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(ProviderError::Initializing)
        }
    }

    /// Create a new agent with a credential record derived from the secret
    pub fn add(&self, name: &str, secret: &str) -> Result<(), ProviderError> {
        self.ensure_initialized()?;
        self.registry.add(name)?;

        let mut config = self.registry.config(name)?;
        config.auth = Some(CredentialRecord::new(secret));
        self.registry.update_config(name, &config)?;

        info!(name, "Agent added");
        Ok(())
    }

    /// Delete a stopped agent and all of its data
    pub fn remove(&self, name: &str) -> Result<(), ProviderError> {
        self.ensure_initialized()?;
        if self.running.contains_key(name) {
            return Err(ProviderError::AlreadyRunning(name.to_string()));
        }
        self.registry.remove(name)?;
        self.pending_credentials.lock().remove(name);
        info!(name, "Agent removed");
        Ok(())
    }

    /// Start an agent instance on a freshly allocated port.
    ///
    /// The name is reserved before any backend work, so of two concurrent
    /// starts exactly one materializes an instance and the other gets
    /// `AlreadyRunning`. Admission control uses the average resident memory
    /// of the currently running instances as the expected footprint of one
    /// more.
    pub async fn start(&self, name: &str) -> Result<(), ProviderError> {
        self.ensure_initialized()?;
        if !self.registry.has(name) {
            return Err(ProviderError::NotFound(name.to_string()));
        }

        {
            let mut starting = self.starting.lock();
            if self.running.contains_key(name) || !starting.insert(name.to_string()) {
                return Err(ProviderError::AlreadyRunning(name.to_string()));
            }
        }

        let result = self.start_reserved(name).await;
        self.starting.lock().remove(name);
        result
    }

    async fn start_reserved(&self, name: &str) -> Result<(), ProviderError> {
        let expected = self.collect_memory_usage().await.average_usage;
        if expected > 0 {
            let free = (self.free_memory)();
            if expected > free {
                warn!(name, expected, free, "Refusing start, not enough free memory");
                return Err(ProviderError::NotEnoughFreeMemory(name.to_string()));
            }
        }

        let port = self.ports.acquire();
        let ctx = StartContext {
            name: name.to_string(),
            instance_dir: self.registry.instance_path(name),
            data_dir: self.registry.data_path(name),
            port,
            credentials: self.pending_credentials.lock().remove(name),
        };

        let handle = match self.backend.start(&ctx).await {
            Ok(handle) => handle,
            Err(e) => {
                self.ports.release(port);
                return Err(ProviderError::Backend(e));
            }
        };

        self.running.insert(name.to_string(), handle);
        info!(name, port, "Agent started");
        Ok(())
    }

    /// Stop a running agent and release its port
    pub async fn stop(&self, name: &str) -> Result<(), ProviderError> {
        self.ensure_initialized()?;
        let (_, handle) = self.running.remove(name).ok_or_else(|| {
            if self.registry.has(name) {
                ProviderError::NotRunning(name.to_string())
            } else {
                ProviderError::NotFound(name.to_string())
            }
        })?;

        let port = handle.port();
        let result = self.backend.stop(name, handle).await;
        self.ports.release(port);
        result.map_err(ProviderError::Backend)?;

        info!(name, "Agent stopped");
        Ok(())
    }

    /// State of a single agent; unknown names are an error even when the
    /// backend could answer without the registry
    pub fn status(&self, name: &str) -> Result<AgentInfo, ProviderError> {
        self.ensure_initialized()?;
        if !self.registry.has(name) {
            return Err(ProviderError::NotFound(name.to_string()));
        }
        Ok(self.info(name))
    }

    /// All known agents with their current state, sorted by name
    pub fn list(&self) -> Result<Vec<AgentInfo>, ProviderError> {
        self.ensure_initialized()?;
        Ok(self
            .registry
            .list()
            .into_iter()
            .map(|name| self.info(&name))
            .collect())
    }

    fn info(&self, name: &str) -> AgentInfo {
        match self.running.get(name) {
            Some(handle) => AgentInfo {
                name: name.to_string(),
                state: AgentState::Running,
                uri: Some(format!("http://127.0.0.1:{}", handle.port())),
            },
            None => AgentInfo {
                name: name.to_string(),
                state: AgentState::Stopped,
                uri: None,
            },
        }
    }

    /// Port of a running instance; `NotRunning` for a stopped one
    pub fn runtime(&self, name: &str) -> Result<RuntimeInfo, ProviderError> {
        self.ensure_initialized()?;
        match self.running.get(name) {
            Some(handle) => Ok(RuntimeInfo {
                port: handle.port(),
            }),
            None if self.registry.has(name) => Err(ProviderError::NotRunning(name.to_string())),
            None => Err(ProviderError::NotFound(name.to_string())),
        }
    }

    /// Wipe a stopped agent's data directory, keeping its credentials
    pub fn reset_data(&self, name: &str) -> Result<(), ProviderError> {
        self.ensure_initialized()?;
        if self.running.contains_key(name) {
            return Err(ProviderError::AlreadyRunning(name.to_string()));
        }
        self.registry.reset_data(name)?;
        info!(name, "Agent data reset");
        Ok(())
    }

    /// Check a secret against the agent's stored credential record.
    ///
    /// On success the plaintext is parked for the next `start` so a fresh
    /// instance can receive it over its stdin. A missing record or a wrong
    /// secret both report plain failure.
    pub fn authenticate(&self, name: &str, secret: &str) -> Result<bool, ProviderError> {
        self.ensure_initialized()?;
        let config = self.registry.config(name)?;

        let ok = config
            .auth
            .map(|record| record.verify(secret))
            .unwrap_or(false);

        if ok {
            self.pending_credentials.lock().insert(
                name.to_string(),
                HandoffCredentials {
                    user: name.to_string(),
                    password: secret.to_string(),
                },
            );
        }
        Ok(ok)
    }

    /// Memory report over all running instances
    pub async fn memory_usage(&self) -> Result<MemoryUsage, ProviderError> {
        self.ensure_initialized()?;
        Ok(self.collect_memory_usage().await)
    }

    async fn collect_memory_usage(&self) -> MemoryUsage {
        // Probes are extracted under the map lock, measured after
        let probes: Vec<(String, MemoryProbe)> = self
            .running
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().memory_probe()))
            .collect();

        let mut agents = Vec::with_capacity(probes.len());
        let mut total = 0u64;
        for (name, probe) in probes {
            let memory_usage = self.backend.memory_usage(&probe).await;
            total += memory_usage;
            agents.push(AgentMemoryUsage { name, memory_usage });
        }
        agents.sort_by(|a, b| a.name.cmp(&b.name));

        let average = if agents.is_empty() {
            0
        } else {
            total / agents.len() as u64
        };

        MemoryUsage {
            total_usage: total,
            average_usage: average,
            agents,
        }
    }

    /// Stop every running instance, used during shutdown
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                error!(name, error = %e, "Failed to stop agent during shutdown");
            }
        }
    }
}

/// Shared provider handle used by both servers
pub type SharedProvider = Arc<Provider>;
