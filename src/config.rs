use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the dispatcher
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Provider and backend configuration
    pub provider: ProviderConfig,

    /// Reverse proxy tuning
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port for the RESTful control API (default: 4443)
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Port for the authenticating reverse proxy (default: 8080)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            proxy_port: default_proxy_port(),
            bind: default_bind_address(),
        }
    }
}

/// Which backend materializes agent instances
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Forked subprocess per instance
    #[default]
    Fork,
    /// Docker container per instance
    Docker,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Root directory holding one subdirectory per agent
    pub root_path: PathBuf,

    /// Backend variant (default: fork)
    #[serde(default)]
    pub backend: BackendKind,

    /// Fork backend settings (required when backend = "fork")
    #[serde(default)]
    pub fork: Option<ForkConfig>,

    /// Docker backend settings (required when backend = "docker")
    #[serde(default)]
    pub docker: Option<DockerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForkConfig {
    /// Program launched for each agent instance
    pub command: String,

    /// Arguments passed to the agent program
    #[serde(default)]
    pub args: Vec<String>,

    /// One-shot setup program run before first launch (optional)
    pub setup_command: Option<String>,

    /// Arguments for the setup program
    #[serde(default)]
    pub setup_args: Vec<String>,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl ForkConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Image name; a name containing '/' is pulled from a registry,
    /// anything else is built from `build_context` when missing
    pub image: String,

    /// Docker daemon endpoint (unix:///... or tcp://...); falls back to
    /// DOCKER_HOST and then platform defaults
    pub docker_host: Option<String>,

    /// Directory with the Dockerfile used to build a local image
    pub build_context: Option<PathBuf>,

    /// Port the agent listens on inside the container
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Command run inside the container for the one-time data setup
    #[serde(default)]
    pub setup_command: Vec<String>,

    /// Command run inside the main container (empty = image default)
    #[serde(default)]
    pub run_command: Vec<String>,

    /// Seconds to wait for graceful container stop before killing
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl DockerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Secret used to sign session cookies; a random one is generated when unset
    pub cookie_secret: Option<String>,

    /// Attempts when polling the control API for the instance to report running
    #[serde(default = "default_start_attempts")]
    pub start_poll_attempts: u32,

    /// Interval between runtime polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub start_poll_interval_ms: u64,

    /// Attempts when probing the freshly started backend over HTTP
    #[serde(default = "default_probe_attempts")]
    pub health_probe_attempts: u32,

    /// Interval between health probes in milliseconds
    #[serde(default = "default_poll_interval")]
    pub health_probe_interval_ms: u64,
}

impl ProxyConfig {
    pub fn start_poll_interval(&self) -> Duration {
        Duration::from_millis(self.start_poll_interval_ms)
    }

    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_millis(self.health_probe_interval_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            cookie_secret: None,
            start_poll_attempts: default_start_attempts(),
            start_poll_interval_ms: default_poll_interval(),
            health_probe_attempts: default_probe_attempts(),
            health_probe_interval_ms: default_poll_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        match self.provider.backend {
            BackendKind::Fork if self.provider.fork.is_none() => {
                anyhow::bail!("backend = \"fork\" requires a [provider.fork] section")
            }
            BackendKind::Docker if self.provider.docker.is_none() => {
                anyhow::bail!("backend = \"docker\" requires a [provider.docker] section")
            }
            _ => Ok(()),
        }
    }
}

fn default_api_port() -> u16 {
    4443
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_grace_period() -> u64 {
    5
}

fn default_container_port() -> u16 {
    4567
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_start_attempts() -> u32 {
    3
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_probe_attempts() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fork_config() {
        let toml = r#"
            [server]
            api_port = 4443
            proxy_port = 8080

            [provider]
            root_path = "/var/lib/agentgate"
            backend = "fork"

            [provider.fork]
            command = "mail-agent"
            args = ["--no-browser"]
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.api_port, 4443);
        assert_eq!(config.provider.backend, BackendKind::Fork);
        let fork = config.provider.fork.unwrap();
        assert_eq!(fork.command, "mail-agent");
        assert_eq!(fork.args, vec!["--no-browser".to_string()]);
        assert_eq!(fork.shutdown_grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_docker_config() {
        let toml = r#"
            [provider]
            root_path = "/var/lib/agentgate"
            backend = "docker"

            [provider.docker]
            image = "mail-agent"
            container_port = 4567
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.provider.backend, BackendKind::Docker);
        let docker = config.provider.docker.unwrap();
        assert_eq!(docker.image, "mail-agent");
        assert_eq!(docker.stop_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_defaults() {
        let toml = r#"
            [provider]
            root_path = "/tmp/agents"

            [provider.fork]
            command = "true"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.api_port, 4443);
        assert_eq!(config.server.proxy_port, 8080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.proxy.start_poll_attempts, 3);
        assert_eq!(config.proxy.health_probe_attempts, 10);
    }

    #[test]
    fn test_validate_missing_backend_section() {
        let toml = r#"
            [provider]
            root_path = "/tmp/agents"
            backend = "docker"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
