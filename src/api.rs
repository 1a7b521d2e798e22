//! RESTful control API for agent lifecycle management

use crate::error::{ErrorBody, ProviderError};
use crate::provider::{AgentState, SharedProvider};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Debug, Deserialize)]
struct AddAgentRequest {
    name: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct StateChangeRequest {
    state: AgentState,
}

#[derive(Debug, Deserialize)]
struct AuthenticateRequest {
    password: String,
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn error_response(err: &ProviderError) -> Response<Full<Bytes>> {
    let body = ErrorBody::from_error(err);
    Response::builder()
        .status(err.status_code())
        .header("content-type", "application/json")
        .header("x-agentgate-error", err.code())
        .body(Full::new(Bytes::from(body.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

fn ok_json<T: serde::Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to serialize response body");
            response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failure")
        }
    }
}

/// Control API server exposing the provider over HTTP
pub struct ApiServer {
    bind_addr: SocketAddr,
    provider: SharedProvider,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        provider: SharedProvider,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            provider,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Control API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let provider = Arc::clone(&self.provider);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let provider = Arc::clone(&provider);
                                    async move { handle_request(req, provider).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Control API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    provider: SharedProvider,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Control API request");

    let response = match route(&path) {
        Route::Health if method == Method::GET => response(StatusCode::OK, "ok"),
        Route::Version if method == Method::GET => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }
        Route::Agents if method == Method::GET => match provider.list() {
            Ok(agents) => ok_json(&serde_json::json!({ "agents": agents })),
            Err(e) => error_response(&e),
        },
        Route::Agents if method == Method::POST => {
            let body: AddAgentRequest = match read_json(req).await? {
                Ok(body) => body,
                Err(resp) => return Ok(resp),
            };
            match provider.add(&body.name, &body.password) {
                Ok(()) => match provider.status(&body.name) {
                    Ok(info) => {
                        let location = format!("/agents/{}", info.name);
                        let body = serde_json::to_string(&info).unwrap_or_default();
                        Response::builder()
                            .status(StatusCode::CREATED)
                            .header("content-type", "application/json")
                            .header("location", location)
                            .body(Full::new(Bytes::from(body)))
                            .expect("valid response with StatusCode enum and ascii headers")
                    }
                    Err(e) => error_response(&e),
                },
                Err(e) => error_response(&e),
            }
        }
        Route::Agent(name) if method == Method::GET => match provider.status(&name) {
            Ok(info) => ok_json(&info),
            Err(e) => error_response(&e),
        },
        Route::Agent(name) if method == Method::DELETE => match provider.remove(&name) {
            Ok(()) => ok_json(&serde_json::json!({ "ok": true })),
            Err(e) => error_response(&e),
        },
        Route::AgentState(name) if method == Method::GET => match provider.status(&name) {
            Ok(info) => ok_json(&serde_json::json!({ "state": info.state })),
            Err(e) => error_response(&e),
        },
        Route::AgentState(name) if method == Method::PUT => {
            let body: StateChangeRequest = match read_json(req).await? {
                Ok(body) => body,
                Err(resp) => return Ok(resp),
            };
            let result = match body.state {
                AgentState::Running => provider.start(&name).await,
                AgentState::Stopped => provider.stop(&name).await,
            };
            match result.and_then(|()| provider.status(&name)) {
                Ok(info) => ok_json(&serde_json::json!({ "state": info.state })),
                Err(e) => error_response(&e),
            }
        }
        Route::AgentResetData(name) if method == Method::PUT => {
            match provider.reset_data(&name) {
                Ok(()) => ok_json(&serde_json::json!({ "state": AgentState::Stopped })),
                Err(e) => error_response(&e),
            }
        }
        Route::AgentRuntime(name) if method == Method::GET => match provider.runtime(&name) {
            Ok(runtime) => ok_json(&runtime),
            Err(e) => error_response(&e),
        },
        Route::AgentAuthenticate(name) if method == Method::POST => {
            let body: AuthenticateRequest = match read_json(req).await? {
                Ok(body) => body,
                Err(resp) => return Ok(resp),
            };
            match provider.authenticate(&name, &body.password) {
                Ok(true) => ok_json(&serde_json::json!({ "ok": true })),
                Ok(false) => json_response(
                    StatusCode::FORBIDDEN,
                    r#"{"code":"INVALID_CREDENTIALS","message":"invalid credentials","status":403}"#,
                ),
                Err(e) => error_response(&e),
            }
        }
        Route::MemoryUsage if method == Method::GET => match provider.memory_usage().await {
            Ok(report) => ok_json(&report),
            Err(e) => error_response(&e),
        },
        Route::Unknown => response(StatusCode::NOT_FOUND, "not found"),
        _ => response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    };

    Ok(response)
}

/// Matched control API route
enum Route {
    Health,
    Version,
    Agents,
    Agent(String),
    AgentState(String),
    AgentResetData(String),
    AgentRuntime(String),
    AgentAuthenticate(String),
    MemoryUsage,
    Unknown,
}

fn route(path: &str) -> Route {
    match path {
        "/health" => return Route::Health,
        "/version" => return Route::Version,
        "/agents" => return Route::Agents,
        "/stats/memory_usage" => return Route::MemoryUsage,
        _ => {}
    }

    let Some(rest) = path.strip_prefix("/agents/") else {
        return Route::Unknown;
    };

    match rest.split_once('/') {
        None if !rest.is_empty() => Route::Agent(rest.to_string()),
        Some((name, action)) if !name.is_empty() => match action {
            "state" => Route::AgentState(name.to_string()),
            "reset_data" => Route::AgentResetData(name.to_string()),
            "runtime" => Route::AgentRuntime(name.to_string()),
            "authenticate" => Route::AgentAuthenticate(name.to_string()),
            _ => Route::Unknown,
        },
        _ => Route::Unknown,
    }
}

/// Collect and parse a JSON request body, answering 400 on garbage
async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> Result<Result<T, Response<Full<Bytes>>>, hyper::Error> {
    let body = req.collect().await?.to_bytes();
    match serde_json::from_slice(&body) {
        Ok(value) => Ok(Ok(value)),
        Err(e) => {
            debug!(error = %e, "Rejecting malformed request body");
            Ok(Err(json_response(
                StatusCode::BAD_REQUEST,
                format!(
                    r#"{{"code":"MALFORMED_BODY","message":"{}","status":400}}"#,
                    e.to_string().replace('"', "'")
                ),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_name(path: &str) -> Option<String> {
        match route(path) {
            Route::Agent(name)
            | Route::AgentState(name)
            | Route::AgentResetData(name)
            | Route::AgentRuntime(name)
            | Route::AgentAuthenticate(name) => Some(name),
            _ => None,
        }
    }

    #[test]
    fn test_routing() {
        assert!(matches!(route("/agents"), Route::Agents));
        assert!(matches!(route("/stats/memory_usage"), Route::MemoryUsage));
        assert!(matches!(route("/agents/alice"), Route::Agent(_)));
        assert!(matches!(route("/agents/alice/state"), Route::AgentState(_)));
        assert!(matches!(
            route("/agents/alice/reset_data"),
            Route::AgentResetData(_)
        ));
        assert!(matches!(
            route("/agents/alice/runtime"),
            Route::AgentRuntime(_)
        ));
        assert!(matches!(
            route("/agents/alice/authenticate"),
            Route::AgentAuthenticate(_)
        ));

        assert!(matches!(route("/agents/"), Route::Unknown));
        assert!(matches!(route("/agents/alice/unknown"), Route::Unknown));
        assert!(matches!(route("//agents"), Route::Unknown));
        assert!(matches!(route("/other"), Route::Unknown));
    }

    #[test]
    fn test_route_extracts_name() {
        assert_eq!(route_name("/agents/alice"), Some("alice".to_string()));
        assert_eq!(route_name("/agents/a.b-c/state"), Some("a.b-c".to_string()));
        assert_eq!(route_name("/agents//state"), None);
    }

    #[test]
    fn test_state_change_body_parses() {
        let body: StateChangeRequest = serde_json::from_str(r#"{"state":"running"}"#).unwrap();
        assert_eq!(body.state, AgentState::Running);
        let body: StateChangeRequest = serde_json::from_str(r#"{"state":"stopped"}"#).unwrap();
        assert_eq!(body.state, AgentState::Stopped);
        assert!(serde_json::from_str::<StateChangeRequest>(r#"{"state":"paused"}"#).is_err());
    }
}
