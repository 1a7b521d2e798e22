//! Integration tests exercising the control API end to end

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agentgate::api::ApiServer;
use agentgate::backend::Backend;
use agentgate::client::{ClientError, DispatcherClient};
use agentgate::config::ForkConfig;
use agentgate::fork::ForkBackend;
use agentgate::provider::{AgentState, Provider};
use agentgate::registry::InstanceRegistry;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::watch;

fn sleep_backend() -> Backend {
    Backend::Fork(ForkBackend::new(ForkConfig {
        command: "sleep".to_string(),
        args: vec!["60".to_string()],
        setup_command: None,
        setup_args: Vec::new(),
        shutdown_grace_period_secs: 1,
    }))
}

/// Wait for a port to accept connections
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

struct TestDispatcher {
    _root: TempDir,
    provider: Arc<Provider>,
    client: DispatcherClient,
    shutdown_tx: watch::Sender<bool>,
}

impl TestDispatcher {
    /// Bring up a provider plus control API on a dedicated port
    async fn start(api_port: u16, initialize: bool) -> Self {
        let root = TempDir::new().unwrap();
        let registry = InstanceRegistry::open(root.path()).unwrap();
        let provider = Arc::new(Provider::new(registry, sleep_backend()));
        if initialize {
            provider.initialize().await.unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let addr: SocketAddr = format!("127.0.0.1:{}", api_port).parse().unwrap();
        let server = ApiServer::new(addr, Arc::clone(&provider), shutdown_rx);
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        assert!(wait_for_port(api_port, Duration::from_secs(5)).await);

        Self {
            _root: root,
            provider,
            client: DispatcherClient::new(format!("http://127.0.0.1:{}", api_port)),
            shutdown_tx,
        }
    }

    async fn shutdown(self) {
        self.provider.stop_all().await;
        let _ = self.shutdown_tx.send(true);
    }
}

#[tokio::test]
async fn test_full_agent_lifecycle() {
    let dispatcher = TestDispatcher::start(46031, true).await;
    let client = &dispatcher.client;

    assert!(client.list().await.unwrap().is_empty());
    assert!(!client.agent_exists("alice").await.unwrap());

    client.add("alice", "secret").await.unwrap();
    assert!(client.agent_exists("alice").await.unwrap());

    let agents = client.list().await.unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].name, "alice");
    assert_eq!(agents[0].state, AgentState::Stopped);
    assert!(agents[0].uri.is_none());

    client.start("alice").await.unwrap();
    let info = client.agent("alice").await.unwrap();
    assert_eq!(info.state, AgentState::Running);
    assert_eq!(info.uri.as_deref(), Some("http://127.0.0.1:5000"));
    assert_eq!(client.runtime("alice").await.unwrap().port, 5000);

    client.stop("alice").await.unwrap();
    let info = client.agent("alice").await.unwrap();
    assert_eq!(info.state, AgentState::Stopped);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_everything_answers_503_while_initializing() {
    let dispatcher = TestDispatcher::start(46032, false).await;
    let client = &dispatcher.client;

    assert!(matches!(
        client.list().await.unwrap_err(),
        ClientError::NotAvailable
    ));
    assert!(matches!(
        client.add("alice", "secret").await.unwrap_err(),
        ClientError::NotAvailable
    ));
    assert!(matches!(
        client.start("alice").await.unwrap_err(),
        ClientError::NotAvailable
    ));

    // Once initialization completes, the same requests go through
    dispatcher.provider.initialize().await.unwrap();
    client.add("alice", "secret").await.unwrap();
    assert!(client.agent_exists("alice").await.unwrap());

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_state_conflicts_are_conflicts() {
    let dispatcher = TestDispatcher::start(46033, true).await;
    let client = &dispatcher.client;

    client.add("alice", "secret").await.unwrap();

    // Stopping a stopped agent
    match client.stop("alice").await.unwrap_err() {
        ClientError::Conflict(code) => assert_eq!(code, "NOT_RUNNING"),
        other => panic!("unexpected error: {:?}", other),
    }

    client.start("alice").await.unwrap();

    // Starting a running agent
    match client.start("alice").await.unwrap_err() {
        ClientError::Conflict(code) => assert_eq!(code, "ALREADY_RUNNING"),
        other => panic!("unexpected error: {:?}", other),
    }

    // Adding a duplicate
    match client.add("alice", "other").await.unwrap_err() {
        ClientError::Conflict(code) => assert_eq!(code, "ALREADY_EXISTS"),
        other => panic!("unexpected error: {:?}", other),
    }

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_unknown_agents_are_not_found() {
    let dispatcher = TestDispatcher::start(46034, true).await;
    let client = &dispatcher.client;

    assert!(matches!(
        client.agent("ghost").await.unwrap_err(),
        ClientError::NotFound
    ));
    assert!(matches!(
        client.runtime("ghost").await.unwrap_err(),
        ClientError::NotFound
    ));
    assert!(matches!(
        client.start("ghost").await.unwrap_err(),
        ClientError::NotFound
    ));
    assert!(matches!(
        client.authenticate("ghost", "pw").await.unwrap_err(),
        ClientError::NotFound
    ));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_authentication_over_the_wire() {
    let dispatcher = TestDispatcher::start(46035, true).await;
    let client = &dispatcher.client;

    client.add("alice", "secret").await.unwrap();

    assert!(client.authenticate("alice", "secret").await.unwrap());
    assert!(!client.authenticate("alice", "wrong").await.unwrap());

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_memory_usage_report() {
    let dispatcher = TestDispatcher::start(46036, true).await;
    let client = &dispatcher.client;

    let report = client.memory_usage().await.unwrap();
    assert_eq!(report.total_usage, 0);
    assert!(report.agents.is_empty());

    client.add("alice", "secret").await.unwrap();
    client.start("alice").await.unwrap();

    let report = client.memory_usage().await.unwrap();
    assert_eq!(report.agents.len(), 1);
    assert_eq!(report.agents[0].name, "alice");
    assert!(report.total_usage > 0);
    assert_eq!(report.average_usage, report.total_usage);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_runtime_of_stopped_agent_is_a_conflict() {
    let dispatcher = TestDispatcher::start(46037, true).await;
    let client = &dispatcher.client;

    client.add("alice", "secret").await.unwrap();

    match client.runtime("alice").await.unwrap_err() {
        ClientError::Conflict(code) => assert_eq!(code, "NOT_RUNNING"),
        other => panic!("unexpected error: {:?}", other),
    }

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_ports_are_reused_lowest_first() {
    let dispatcher = TestDispatcher::start(46038, true).await;
    let client = &dispatcher.client;

    client.add("alice", "secret").await.unwrap();
    client.add("bob", "secret").await.unwrap();

    client.start("alice").await.unwrap();
    client.start("bob").await.unwrap();
    assert_eq!(client.runtime("alice").await.unwrap().port, 5000);
    assert_eq!(client.runtime("bob").await.unwrap().port, 5001);

    client.stop("alice").await.unwrap();
    client.start("alice").await.unwrap();
    assert_eq!(client.runtime("alice").await.unwrap().port, 5000);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_remove_and_reset_data_refuse_running_agents() {
    let dispatcher = TestDispatcher::start(46039, true).await;
    let client = &dispatcher.client;

    client.add("alice", "secret").await.unwrap();
    client.start("alice").await.unwrap();

    // Both are rejected while the agent runs
    assert!(matches!(
        dispatcher.provider.remove("alice").unwrap_err(),
        agentgate::error::ProviderError::AlreadyRunning(_)
    ));
    assert!(matches!(
        dispatcher.provider.reset_data("alice").unwrap_err(),
        agentgate::error::ProviderError::AlreadyRunning(_)
    ));

    client.stop("alice").await.unwrap();
    dispatcher.provider.reset_data("alice").unwrap();
    dispatcher.provider.remove("alice").unwrap();
    assert!(!client.agent_exists("alice").await.unwrap());

    dispatcher.shutdown().await;
}
