use agentgate::api::{ApiServer, PKG_NAME, VERSION};
use agentgate::backend::Backend;
use agentgate::client::DispatcherClient;
use agentgate::config::{BackendKind, Config};
use agentgate::docker::DockerBackend;
use agentgate::fork::ForkBackend;
use agentgate::provider::Provider;
use agentgate::proxy::ProxyServer;
use agentgate::registry::InstanceRegistry;
use agentgate::session::{SessionConfig, SessionManager};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agentgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("agentgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        name = PKG_NAME,
        version = VERSION,
        path = %config_path.display(),
        "Configuration loaded"
    );

    let registry = InstanceRegistry::open(&config.provider.root_path)?;

    let backend = match config.provider.backend {
        BackendKind::Fork => {
            let fork_config = config
                .provider
                .fork
                .clone()
                .expect("validated fork section");
            Backend::Fork(ForkBackend::new(fork_config))
        }
        BackendKind::Docker => {
            let docker_config = config
                .provider
                .docker
                .clone()
                .expect("validated docker section");
            Backend::Docker(DockerBackend::new(docker_config).await?)
        }
    };

    let provider = Arc::new(Provider::new(registry, backend));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Initialize in the background so both servers can answer 503 while a
    // slow image pull or build is in flight. A failed initialization is
    // fatal for the whole dispatcher.
    let init_provider = Arc::clone(&provider);
    let init_shutdown_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = init_provider.initialize().await {
            error!(error = %e, "Provider initialization failed, shutting down");
            let _ = init_shutdown_tx.send(true);
        }
    });

    let api_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.api_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid control API address: {}", e))?;
    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.proxy_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid proxy address: {}", e))?;

    let api_server = ApiServer::new(api_addr, Arc::clone(&provider), shutdown_rx.clone());
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "Control API server error");
        }
    });

    let client = DispatcherClient::new(format!("http://127.0.0.1:{}", config.server.api_port));
    let sessions = SessionManager::new(match config.proxy.cookie_secret.clone() {
        Some(secret) => SessionConfig {
            secret,
            ..SessionConfig::default()
        },
        None => SessionConfig::default(),
    });

    let proxy_server = ProxyServer::new(
        proxy_addr,
        client,
        sessions,
        config.proxy.clone(),
        shutdown_rx.clone(),
    );
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown(shutdown_rx.clone()).await;

    let _ = shutdown_tx.send(true);

    info!("Stopping all running agents");
    provider.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = api_handle.await;
        let _ = proxy_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Block until SIGINT, SIGTERM or an internal shutdown request
async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
            _ = shutdown_rx.changed() => {
                info!("Internal shutdown requested");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = shutdown_rx.changed() => {
                info!("Internal shutdown requested");
            }
        }
    }
}
