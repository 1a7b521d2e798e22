//! Docker backend: one container per running instance

use crate::backend::{HandoffCredentials, InstanceHandle, StartContext};
use crate::config::DockerConfig;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Mount point of the instance's data directory inside the container
const DATA_MOUNT: &str = "/mnt/user";

/// How long a freshly started container gets to read its credentials
const CREDENTIAL_HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs agent instances as Docker containers via the daemon API.
///
/// Connection priority:
/// 1. Explicit docker_host from the configuration
/// 2. DOCKER_HOST environment variable
/// 3. Platform default socket
pub struct DockerBackend {
    client: Docker,
    config: DockerConfig,
}

impl DockerBackend {
    pub async fn new(config: DockerConfig) -> anyhow::Result<Self> {
        let client = if let Some(ref host) = config.docker_host {
            connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            connect_to_host(&host)?
        } else {
            Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client, config })
    }

    /// Make sure the agent image exists: keep a local image, pull a
    /// registry-qualified name, build anything else from the build context.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let image = &self.config.image;

        if self.client.inspect_image(image).await.is_ok() {
            debug!(image, "Agent image exists locally");
            return Ok(());
        }

        if image.contains('/') {
            self.pull_image(image).await
        } else {
            self.build_image(image).await
        }
    }

    async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
        info!(image, "Pulling agent image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress =
                result.map_err(|e| anyhow::anyhow!("Failed to pull '{}': {}", image, e))?;
            if let Some(status) = progress.status {
                debug!(image, status, "Pull progress");
            }
            if let Some(err) = progress.error {
                anyhow::bail!("Failed to pull '{}': {}", image, err);
            }
        }

        info!(image, "Image pulled");
        Ok(())
    }

    /// Build the agent image from the configured Dockerfile context.
    ///
    /// Build output stays at debug while the build succeeds; on failure the
    /// full transcript is replayed at error level so the cause is visible.
    async fn build_image(&self, image: &str) -> anyhow::Result<()> {
        let context = self.config.build_context.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "Image '{}' is not present and no build_context is configured",
                image
            )
        })?;

        info!(image, context = %context.display(), "Building agent image");

        let mut tarball = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tarball);
            builder.append_dir_all(".", context)?;
            builder.finish()?;
        }

        let options = BuildImageOptions {
            dockerfile: "Dockerfile",
            t: image,
            rm: true,
            ..Default::default()
        };

        let mut transcript = Vec::new();
        let mut stream = self.client.build_image(options, None, Some(tarball.into()));

        while let Some(result) = stream.next().await {
            let progress = match result {
                Ok(progress) => progress,
                Err(e) => {
                    replay_transcript(image, &transcript);
                    anyhow::bail!("Failed to build image '{}': {}", image, e);
                }
            };
            if let Some(line) = progress.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(image, "{}", line);
                    transcript.push(line.to_string());
                }
            }
            if let Some(err) = progress.error {
                replay_transcript(image, &transcript);
                anyhow::bail!("Failed to build image '{}': {}", image, err);
            }
        }

        info!(image, "Image built");
        Ok(())
    }

    /// Run the data setup step and start the agent container
    pub async fn start(&self, ctx: &StartContext) -> anyhow::Result<InstanceHandle> {
        self.run_prepare_container(ctx).await?;

        let name = main_container_name(&ctx.name);
        self.remove_container(&name).await;

        let container_port = format!("{}/tcp", self.config.container_port);

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(ctx.port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(container_port, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: Some(vec![bind_spec(ctx)]),
            ..Default::default()
        };

        let cmd = if self.config.run_command.is_empty() {
            None
        } else {
            Some(self.config.run_command.clone())
        };

        let container_config = Config {
            image: Some(self.config.image.clone()),
            cmd,
            env: Some(vec![format!("AGENT_HOME={}", DATA_MOUNT)]),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            open_stdin: Some(true),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create container '{}': {}", name, e))?;

        let container_id = response.id;
        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start container '{}': {}", name, e))?;

        info!(name = %ctx.name, container_id, port = ctx.port, "Started agent container");

        if let Some(ref credentials) = ctx.credentials {
            self.hand_off_credentials(&ctx.name, &container_id, credentials)
                .await;
        }

        let log_shutdown = self.stream_logs(container_id.clone(), ctx.name.clone());

        Ok(InstanceHandle::Docker {
            container_id,
            port: ctx.port,
            log_shutdown: Some(log_shutdown),
        })
    }

    /// One-shot container that initializes the instance's data directory.
    /// It must exit 0 before the agent itself is allowed to start.
    async fn run_prepare_container(&self, ctx: &StartContext) -> anyhow::Result<()> {
        if self.config.setup_command.is_empty() {
            return Ok(());
        }

        let name = prepare_container_name(&ctx.name);
        self.remove_container(&name).await;

        let host_config = HostConfig {
            binds: Some(vec![bind_spec(ctx)]),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.config.image.clone()),
            cmd: Some(self.config.setup_command.clone()),
            env: Some(vec![format!("AGENT_HOME={}", DATA_MOUNT)]),
            host_config: Some(host_config),
            ..Default::default()
        };

        debug!(name = %ctx.name, "Running data setup container");

        let response = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create setup container '{}': {}", name, e))?;

        self.client
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start setup container '{}': {}", name, e))?;

        let mut wait = self
            .client
            .wait_container(&response.id, None::<WaitContainerOptions<String>>);
        let status_code = match wait.next().await {
            Some(Ok(exit)) => exit.status_code,
            Some(Err(e)) => {
                self.remove_container(&response.id).await;
                anyhow::bail!("Setup container for '{}' failed: {}", ctx.name, e);
            }
            None => {
                self.remove_container(&response.id).await;
                anyhow::bail!("Setup container for '{}' vanished before exiting", ctx.name);
            }
        };

        self.remove_container(&response.id).await;

        if status_code != 0 {
            anyhow::bail!(
                "Setup container for '{}' exited with status {}",
                ctx.name,
                status_code
            );
        }
        Ok(())
    }

    /// Write the credentials to the container's stdin as one JSON line.
    ///
    /// The write is bounded by a watchdog so an agent that never reads its
    /// stdin cannot wedge the start path.
    async fn hand_off_credentials(
        &self,
        name: &str,
        container_id: &str,
        credentials: &HandoffCredentials,
    ) {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stream: Some(true),
            ..Default::default()
        };

        let mut attach = match self
            .client
            .attach_container(container_id, Some(options))
            .await
        {
            Ok(attach) => attach,
            Err(e) => {
                warn!(name, error = %e, "Could not attach to container for credential handoff");
                return;
            }
        };

        let payload = credentials.to_json_line();
        let write = async {
            attach.input.write_all(payload.as_bytes()).await?;
            attach.input.flush().await?;
            Ok::<_, std::io::Error>(())
        };

        match tokio::time::timeout(CREDENTIAL_HANDOFF_TIMEOUT, write).await {
            Ok(Ok(())) => debug!(name, "Credentials handed to agent"),
            Ok(Err(e)) => warn!(name, error = %e, "Credential handoff failed"),
            Err(_) => warn!(name, "Agent did not accept credentials within the watchdog window"),
        }
    }

    /// Graceful stop with a bounded timeout, then kill, then remove
    pub async fn stop(&self, name: &str, container_id: &str) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: self.config.stop_timeout().as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => info!(name, container_id, "Stopped agent container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!(name, container_id, "Container was already stopped"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!(name, container_id, "Container not found"),
            Err(e) => {
                warn!(name, container_id, error = %e, "Stop failed, killing container");
                if let Err(e) = self
                    .client
                    .kill_container::<String>(container_id, None)
                    .await
                {
                    error!(name, container_id, error = %e, "Kill failed");
                }
            }
        }

        self.remove_container(container_id).await;
        Ok(())
    }

    async fn remove_container(&self, container: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container, Some(options)).await {
            Ok(_) => debug!(container, "Removed container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => warn!(container, error = %e, "Failed to remove container"),
        }
    }

    /// Resident memory of the container's main process, 0 when not observable
    pub async fn memory_usage(&self, container_id: &str) -> u64 {
        let pid = match self.client.inspect_container(container_id, None).await {
            Ok(info) => info.state.and_then(|s| s.pid).unwrap_or(0),
            Err(_) => 0,
        };
        if pid <= 0 {
            return 0;
        }
        crate::fork::rss_bytes(pid as u32)
    }

    /// Forward container output to tracing until the returned sender fires
    fn stream_logs(&self, container_id: String, name: String) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = self.client.clone();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };

            let mut log_stream = client.logs(&container_id, Some(options));

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(name, container_id, "Log streaming stopped");
                        break;
                    }
                    log = log_stream.next() => {
                        match log {
                            Some(Ok(output)) => forward_log_line(&name, output),
                            Some(Err(e)) => {
                                warn!(name, container_id, error = %e, "Error reading container logs");
                                break;
                            }
                            None => {
                                debug!(name, container_id, "Container log stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}

fn forward_log_line(name: &str, output: LogOutput) {
    let (stream, message) = match output {
        LogOutput::StdOut { message } => ("stdout", message),
        LogOutput::StdErr { message } => ("stderr", message),
        LogOutput::Console { message } => ("console", message),
        LogOutput::StdIn { .. } => return,
    };

    if let Ok(line) = String::from_utf8(message.to_vec()) {
        let line = line.trim_end();
        if !line.is_empty() {
            if stream == "stderr" {
                warn!(target: "agent", name, stream, "{}", line);
            } else {
                info!(target: "agent", name, stream, "{}", line);
            }
        }
    }
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if host.starts_with("unix://") {
        let socket_path = host.trim_start_matches("unix://");
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker_host '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

fn replay_transcript(image: &str, transcript: &[String]) {
    for line in transcript {
        error!(image, "{}", line);
    }
}

fn main_container_name(name: &str) -> String {
    format!("agentgate-{}", name)
}

fn prepare_container_name(name: &str) -> String {
    format!("agentgate-{}-prepare", name)
}

fn bind_spec(ctx: &StartContext) -> String {
    format!("{}:{}", ctx.data_dir.display(), DATA_MOUNT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_container_names() {
        assert_eq!(main_container_name("alice"), "agentgate-alice");
        assert_eq!(prepare_container_name("alice"), "agentgate-alice-prepare");
    }

    #[test]
    fn test_bind_spec_targets_data_mount() {
        let ctx = StartContext {
            name: "alice".to_string(),
            instance_dir: PathBuf::from("/srv/agents/alice"),
            data_dir: PathBuf::from("/srv/agents/alice/data"),
            port: 5000,
            credentials: None,
        };
        assert_eq!(bind_spec(&ctx), "/srv/agents/alice/data:/mnt/user");
    }

    #[test]
    fn test_credential_payload_is_one_json_line() {
        let payload = HandoffCredentials {
            user: "alice".to_string(),
            password: "secret".to_string(),
        }
        .to_json_line();
        assert!(payload.ends_with('\n'));

        let parsed: serde_json::Value = serde_json::from_str(payload.trim()).unwrap();
        assert_eq!(parsed["user"], "alice");
        assert_eq!(parsed["password"], "secret");
    }
}
