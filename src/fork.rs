//! Fork backend: one OS subprocess per running instance

use crate::backend::StartContext;
use crate::config::ForkConfig;
use std::process::Stdio;
use sysinfo::{Pid, System};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// A forked agent process bound to a port
pub struct ForkedAgent {
    child: Child,
    pid: Option<u32>,
    pub port: u16,
}

impl ForkedAgent {
    /// OS pid captured at spawn time
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Launches and terminates per-instance subprocesses.
///
/// Each running instance owns exactly one OS process; there is no pooling.
pub struct ForkBackend {
    config: ForkConfig,
}

impl ForkBackend {
    pub fn new(config: ForkConfig) -> Self {
        Self { config }
    }

    /// The fork backend has no global setup; instances are prepared lazily
    pub async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Run the one-shot setup step and launch the agent process.
    ///
    /// The child may default to a fixed port, so the chosen port is issued
    /// as a command on its stdin right after spawn.
    pub async fn start(&self, ctx: &StartContext) -> anyhow::Result<ForkedAgent> {
        let gnupg_dir = ctx.instance_dir.join("gnupg");
        std::fs::create_dir_all(&gnupg_dir)?;

        if let Some(ref setup) = self.config.setup_command {
            debug!(name = %ctx.name, command = %setup, "Running agent setup step");
            let status = Command::new(setup)
                .args(&self.config.setup_args)
                .env("AGENT_HOME", &ctx.data_dir)
                .env("GNUPGHOME", &gnupg_dir)
                .status()
                .await?;
            if !status.success() {
                anyhow::bail!("agent setup step for '{}' exited with {}", ctx.name, status);
            }
        }

        info!(name = %ctx.name, command = %self.config.command, port = ctx.port, "Starting forked agent");

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env("AGENT_HOME", &ctx.data_dir)
            .env("GNUPGHOME", &gnupg_dir)
            .env("AGENT_PORT", ctx.port.to_string())
            .spawn()?;

        let pid = child.id();
        info!(name = %ctx.name, pid, "Agent process spawned");

        if let Some(stdin) = child.stdin.as_mut() {
            if let Err(e) = stdin
                .write_all(format!("set port {}\n", ctx.port).as_bytes())
                .await
            {
                warn!(name = %ctx.name, error = %e, "Could not issue port command to agent");
            }
            if let Some(ref credentials) = ctx.credentials {
                if let Err(e) = stdin.write_all(credentials.to_json_line().as_bytes()).await {
                    warn!(name = %ctx.name, error = %e, "Could not hand credentials to agent");
                }
            }
        }

        Ok(ForkedAgent {
            child,
            pid,
            port: ctx.port,
        })
    }

    /// Graceful shutdown: quit command, SIGTERM, bounded wait, then SIGKILL
    pub async fn stop(&self, name: &str, mut agent: ForkedAgent) -> anyhow::Result<()> {
        if let Some(mut stdin) = agent.child.stdin.take() {
            let _ = stdin.write_all(b"quit\n").await;
            let _ = stdin.shutdown().await;
        }

        if let Some(pid) = agent.child.id() {
            info!(name, pid, "Sending SIGTERM to agent");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = agent.child.start_kill();
            }
        }

        let grace = self.config.shutdown_grace_period();
        match tokio::time::timeout(grace, agent.child.wait()).await {
            Ok(Ok(status)) => {
                info!(name, ?status, "Agent process exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(name, error = %e, "Error waiting for agent to exit");
            }
            Err(_) => {
                warn!(
                    name,
                    grace_secs = grace.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = agent.child.kill().await;
            }
        }

        Ok(())
    }
}

/// Resident memory in bytes for an arbitrary pid
pub(crate) fn rss_bytes(pid: u32) -> u64 {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    sys.refresh_process(pid);
    sys.process(pid).map(|p| p.memory()).unwrap_or(0)
}

/// Memory currently available on the host in bytes
pub(crate) fn free_system_memory() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StartContext;
    use tempfile::TempDir;

    fn sleep_backend() -> ForkBackend {
        ForkBackend::new(ForkConfig {
            command: "sleep".to_string(),
            args: vec!["60".to_string()],
            setup_command: None,
            setup_args: Vec::new(),
            shutdown_grace_period_secs: 1,
        })
    }

    fn context(dir: &TempDir, port: u16) -> StartContext {
        let instance_dir = dir.path().join("alice");
        let data_dir = instance_dir.join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        StartContext {
            name: "alice".to_string(),
            instance_dir,
            data_dir,
            port,
            credentials: None,
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let backend = sleep_backend();

        let agent = backend.start(&context(&dir, 5000)).await.unwrap();
        assert_eq!(agent.port, 5000);
        assert!(agent.pid.is_some());
        assert!(dir.path().join("alice").join("gnupg").is_dir());

        backend.stop("alice", agent).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_unknown_command_fails() {
        let dir = TempDir::new().unwrap();
        let backend = ForkBackend::new(ForkConfig {
            command: "/nonexistent/agent-binary".to_string(),
            args: Vec::new(),
            setup_command: None,
            setup_args: Vec::new(),
            shutdown_grace_period_secs: 1,
        });

        assert!(backend.start(&context(&dir, 5000)).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_setup_step_aborts_start() {
        let dir = TempDir::new().unwrap();
        let backend = ForkBackend::new(ForkConfig {
            command: "sleep".to_string(),
            args: vec!["60".to_string()],
            setup_command: Some("false".to_string()),
            setup_args: Vec::new(),
            shutdown_grace_period_secs: 1,
        });

        assert!(backend.start(&context(&dir, 5000)).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_usage_of_live_process() {
        let dir = TempDir::new().unwrap();
        let backend = sleep_backend();

        let agent = backend.start(&context(&dir, 5001)).await.unwrap();
        // A freshly spawned sleep has a nonzero resident set
        let pid = agent.pid().unwrap();
        assert!(rss_bytes(pid) > 0);

        backend.stop("alice", agent).await.unwrap();
    }

    #[test]
    fn test_rss_of_current_process() {
        assert!(rss_bytes(std::process::id()) > 0);
    }

    #[test]
    fn test_free_memory_is_nonzero() {
        assert!(free_system_memory() > 0);
    }
}
