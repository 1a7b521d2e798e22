//! Authenticating reverse proxy in front of per-user agent instances
//!
//! Every request is tied to a session cookie. The login flow authenticates
//! against the control API, starts the user's instance when needed and only
//! then redirects into the agent UI. All other paths are forwarded verbatim
//! to the instance owned by the session's user.

use crate::client::{ClientError, DispatcherClient};
use crate::config::ProxyConfig;
use crate::session::{self, SessionManager};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full_body(body))
        .expect("valid response with StatusCode enum")
}

fn html(status: StatusCode, body: String, cookies: &[String]) -> Response<ProxyBody> {
    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/html; charset=utf-8");
    for cookie in cookies {
        builder = builder.header(SET_COOKIE, cookie);
    }
    builder
        .body(full_body(body))
        .expect("valid response with static headers")
}

fn redirect(location: &str, cookies: &[String]) -> Response<ProxyBody> {
    let mut builder = Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location);
    for cookie in cookies {
        builder = builder.header(SET_COOKIE, cookie);
    }
    builder
        .body(full_body(""))
        .expect("valid redirect response")
}

/// Shared state for every proxy connection
struct ProxyContext {
    client: DispatcherClient,
    sessions: SessionManager,
    config: ProxyConfig,
    /// Pooled client streaming request bodies straight through
    upstream: Client<HttpConnector, Incoming>,
    /// Separate client for health probes, which carry no body
    probe: Client<HttpConnector, Empty<Bytes>>,
}

/// The user-facing proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        client: DispatcherClient,
        sessions: SessionManager,
        config: ProxyConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let upstream = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .build(connector.clone());
        let probe = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            bind_addr,
            ctx: Arc::new(ProxyContext {
                client,
                sessions,
                config,
                upstream,
                probe,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let ctx = Arc::clone(&ctx);
                                    async move { handle_request(req, ctx).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Proxy connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept proxy connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Proxy request");

    match (method, path.as_str()) {
        (Method::GET, "/auth/login") => Ok(login_page(&req)),
        (Method::POST, "/auth/login") => handle_login(req, ctx).await,
        (Method::GET, "/auth/logout") => Ok(handle_logout(&req, &ctx)),
        _ => forward_to_agent(req, ctx).await,
    }
}

/// Render the login form with a fresh CSRF double-submit cookie
fn login_page(req: &Request<Incoming>) -> Response<ProxyBody> {
    let cookie_header = cookie_header(req);

    let error_msg = cookie_header
        .as_deref()
        .and_then(|h| session::cookie_value(h, session::ERROR_COOKIE))
        .and_then(|v| urlencoding::decode(&v).map(|s| s.into_owned()).ok());

    let next = query_param(req, "next")
        .filter(|n| safe_next(n))
        .unwrap_or_else(|| "/".to_string());

    let csrf_token = session::random_token(32);
    let cookies = vec![
        session::csrf_cookie(&csrf_token),
        session::clear_error_cookie(),
    ];

    html(
        StatusCode::OK,
        render_login_form(&csrf_token, &next, error_msg.as_deref()),
        &cookies,
    )
}

async fn handle_login(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let csrf_cookie = cookie_header(&req)
        .as_deref()
        .and_then(|h| session::cookie_value(h, session::CSRF_COOKIE));

    let body = req.collect().await?.to_bytes();
    let form = parse_form(&body);

    let username = form.get("username").cloned().unwrap_or_default();
    let password = form.get("password").cloned().unwrap_or_default();
    let form_token = form.get("csrf_token").cloned().unwrap_or_default();
    let next = form
        .get("next")
        .filter(|n| safe_next(n))
        .cloned()
        .unwrap_or_else(|| "/".to_string());

    // Double-submit check: the form token must match the cookie
    let csrf_ok = match csrf_cookie {
        Some(cookie) => !form_token.is_empty() && cookie == form_token,
        None => false,
    };
    if !csrf_ok {
        warn!(username, "Login rejected, CSRF token mismatch");
        return Ok(login_failure(&next, "Invalid request, please try again"));
    }

    if username.is_empty() || password.is_empty() {
        return Ok(login_failure(&next, "Username and password are required"));
    }

    match ctx.client.authenticate(&username, &password).await {
        Ok(true) => {}
        Ok(false) => {
            info!(username, "Login rejected, invalid credentials");
            return Ok(login_failure(&next, "Invalid credentials"));
        }
        Err(ClientError::NotFound) => {
            // Same user-visible answer as a wrong password
            info!(username, "Login rejected, unknown agent");
            return Ok(login_failure(&next, "Invalid credentials"));
        }
        Err(ClientError::NotAvailable) => {
            return Ok(login_failure(&next, "Service is starting up, try again shortly"));
        }
        Err(e) => {
            error!(username, error = %e, "Authentication backend failure");
            return Ok(login_failure(&next, "Service temporarily unavailable"));
        }
    }

    if let Err(e) = ensure_running(&ctx, &username).await {
        error!(username, error = %e, "Could not bring up agent after login");
        return Ok(login_failure(&next, "Your agent could not be started, try again"));
    }

    let session_cookie = match ctx.sessions.create_session_cookie(&username) {
        Ok(cookie) => cookie,
        Err(e) => {
            error!(username, error = %e, "Failed to issue session cookie");
            return Ok(plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "session failure",
            ));
        }
    };

    info!(username, "Login succeeded");
    Ok(redirect(&next, &[session_cookie]))
}

fn login_failure(next: &str, message: &str) -> Response<ProxyBody> {
    let location = if next == "/" {
        "/auth/login".to_string()
    } else {
        format!("/auth/login?next={}", urlencoding::encode(next))
    };
    redirect(&location, &[session::error_cookie(message)])
}

/// Clear the session and stop the user's instance in the background
fn handle_logout(req: &Request<Incoming>, ctx: &ProxyContext) -> Response<ProxyBody> {
    let user = ctx
        .sessions
        .authenticated_user(cookie_header(req).as_deref());

    if let Some(username) = user {
        info!(username, "Logout, stopping agent");
        let client = ctx.client.clone();
        tokio::spawn(async move {
            match client.stop(&username).await {
                Ok(()) | Err(ClientError::Conflict(_)) => {}
                Err(e) => warn!(username, error = %e, "Failed to stop agent on logout"),
            }
        });
    }

    redirect(
        "/auth/login",
        &[ctx.sessions.clear_session_cookie()],
    )
}

/// Request-ID header propagated to the agent for log correlation
const X_REQUEST_ID: &str = "x-request-id";

/// Forward an authenticated request verbatim to the user's instance
async fn forward_to_agent(
    mut req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let username = match ctx
        .sessions
        .authenticated_user(cookie_header(&req).as_deref())
    {
        Some(username) => username,
        None => return Ok(unauthenticated_response(&req)),
    };

    // Propagate an existing request id or mint one
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    let port = match ensure_running(&ctx, &username).await {
        Ok(port) => port,
        Err(AgentUnavailable::NotFound) => {
            // The agent was deleted while the session was still valid, so
            // the session is cleared along with the way out
            let mut response = unauthenticated_response(&req);
            if let Ok(value) = HeaderValue::from_str(&ctx.sessions.clear_session_cookie()) {
                response.headers_mut().append(SET_COOKIE, value);
            }
            return Ok(response);
        }
        Err(e) => {
            warn!(username, error = %e, "Agent unavailable for forwarding");
            return Ok(plain(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("agent for {} is currently unavailable", username),
            ));
        }
    };

    let uri = format!(
        "http://127.0.0.1:{}{}",
        port,
        req.uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(&uri);
    for (key, value) in parts.headers.iter() {
        builder = builder.header(key, value);
    }

    let upstream_req = match builder.body(body) {
        Ok(req) => req,
        Err(e) => {
            error!(username, error = %e, "Failed to build upstream request");
            return Ok(plain(StatusCode::BAD_GATEWAY, "bad upstream request"));
        }
    };

    match ctx.upstream.request(upstream_req).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Err(e) => {
            error!(username, port, request_id, error = %e, "Failed to forward request");
            Ok(plain(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("agent for {} did not answer", username),
            ))
        }
    }
}

/// Why an instance could not be made available
#[derive(Debug, thiserror::Error)]
enum AgentUnavailable {
    #[error("agent does not exist")]
    NotFound,
    #[error("dispatcher is initializing")]
    Initializing,
    #[error("instance did not report running in time")]
    StartTimedOut,
    #[error("instance never answered its health probe")]
    NeverHealthy,
    #[error("control API failure: {0}")]
    Control(ClientError),
}

/// Make sure the user's instance is running and answering, starting it on
/// demand. Returns the instance's loopback port.
async fn ensure_running(
    ctx: &ProxyContext,
    username: &str,
) -> Result<u16, AgentUnavailable> {
    let port = match ctx.client.runtime(username).await {
        Ok(runtime) => runtime.port,
        Err(ClientError::Conflict(code)) if code == "NOT_RUNNING" => {
            start_and_poll(ctx, username).await?
        }
        Err(ClientError::NotFound) => return Err(AgentUnavailable::NotFound),
        Err(ClientError::NotAvailable) => return Err(AgentUnavailable::Initializing),
        Err(e) => return Err(AgentUnavailable::Control(e)),
    };

    probe_health(ctx, username, port).await?;
    Ok(port)
}

async fn start_and_poll(ctx: &ProxyContext, username: &str) -> Result<u16, AgentUnavailable> {
    debug!(username, "Starting agent on demand");

    match ctx.client.start(username).await {
        Ok(()) => {}
        // Someone else started it first, which is just as good
        Err(ClientError::Conflict(code)) if code == "ALREADY_RUNNING" => {}
        Err(ClientError::NotFound) => return Err(AgentUnavailable::NotFound),
        Err(ClientError::NotAvailable) => return Err(AgentUnavailable::Initializing),
        Err(e) => return Err(AgentUnavailable::Control(e)),
    }

    for attempt in 0..ctx.config.start_poll_attempts {
        match ctx.client.runtime(username).await {
            Ok(runtime) => return Ok(runtime.port),
            Err(ClientError::Conflict(code)) if code == "NOT_RUNNING" => {
                debug!(username, attempt, "Agent not running yet");
            }
            Err(ClientError::NotFound) => return Err(AgentUnavailable::NotFound),
            Err(ClientError::NotAvailable) => return Err(AgentUnavailable::Initializing),
            Err(e) => return Err(AgentUnavailable::Control(e)),
        }
        tokio::time::sleep(ctx.config.start_poll_interval()).await;
    }

    Err(AgentUnavailable::StartTimedOut)
}

/// Probe the instance over HTTP until it answers anything at all
async fn probe_health(
    ctx: &ProxyContext,
    username: &str,
    port: u16,
) -> Result<(), AgentUnavailable> {
    let uri = format!("http://127.0.0.1:{}/", port);

    for attempt in 0..ctx.config.health_probe_attempts {
        let req = Request::builder()
            .method(Method::GET)
            .uri(&uri)
            .body(Empty::<Bytes>::new());
        if let Ok(req) = req {
            if ctx.probe.request(req).await.is_ok() {
                return Ok(());
            }
        }
        debug!(username, port, attempt, "Agent not answering yet");
        tokio::time::sleep(ctx.config.health_probe_interval()).await;
    }

    Err(AgentUnavailable::NeverHealthy)
}

/// Browsers get redirected to the login form, API clients get a plain 401
fn unauthenticated_response(req: &Request<Incoming>) -> Response<ProxyBody> {
    if wants_html(req) {
        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = format!("/auth/login?next={}", urlencoding::encode(target));
        redirect(&location, &[])
    } else {
        plain(StatusCode::UNAUTHORIZED, "authentication required")
    }
}

fn wants_html(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false)
}

fn cookie_header(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(COOKIE)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .map(str::to_string)
}

fn query_param(req: &Request<Incoming>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            return urlencoding::decode(value).map(|v| v.into_owned()).ok();
        }
    }
    None
}

/// Only same-origin absolute paths are allowed as post-login targets
fn safe_next(next: &str) -> bool {
    next.starts_with('/') && !next.starts_with("//") && !next.starts_with("/\\")
}

/// Parse an application/x-www-form-urlencoded body
fn parse_form(body: &[u8]) -> HashMap<String, String> {
    let Ok(body) = std::str::from_utf8(body) else {
        return HashMap::new();
    };

    body.split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = urlencoding::decode(key).ok()?.into_owned();
            let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_login_form(csrf_token: &str, next: &str, error_msg: Option<&str>) -> String {
    let error_block = match error_msg {
        Some(msg) => format!(r#"<p class="error">{}</p>"#, escape_html(msg)),
        None => String::new(),
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Sign in</title></head>
<body>
<h1>Sign in</h1>
{error_block}
<form method="post" action="/auth/login">
<input type="hidden" name="csrf_token" value="{csrf}">
<input type="hidden" name="next" value="{next}">
<label>Username <input type="text" name="username" autofocus></label>
<label>Password <input type="password" name="password"></label>
<button type="submit">Sign in</button>
</form>
</body>
</html>
"#,
        error_block = error_block,
        csrf = escape_html(csrf_token),
        next = escape_html(next),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_form() {
        let form = parse_form(b"username=alice&password=s%26cret&next=%2Fmail");
        assert_eq!(form.get("username").unwrap(), "alice");
        assert_eq!(form.get("password").unwrap(), "s&cret");
        assert_eq!(form.get("next").unwrap(), "/mail");
    }

    #[test]
    fn test_parse_form_plus_as_space() {
        let form = parse_form(b"password=two+words");
        assert_eq!(form.get("password").unwrap(), "two words");
    }

    #[test]
    fn test_parse_form_garbage() {
        assert!(parse_form(b"no-equals-sign").is_empty());
        assert!(parse_form(&[0xff, 0xfe]).is_empty());
    }

    #[test]
    fn test_safe_next() {
        assert!(safe_next("/"));
        assert!(safe_next("/mail/inbox"));
        assert!(!safe_next("//evil.example.com"));
        assert!(!safe_next("/\\evil.example.com"));
        assert!(!safe_next("http://evil.example.com"));
        assert!(!safe_next(""));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<script>"a"&b</script>"#),
            "&lt;script&gt;&quot;a&quot;&amp;b&lt;/script&gt;"
        );
    }

    #[test]
    fn test_login_form_embeds_token_and_error() {
        let page = render_login_form("tok123", "/mail", Some("Invalid credentials"));
        assert!(page.contains(r#"value="tok123""#));
        assert!(page.contains(r#"value="/mail""#));
        assert!(page.contains("Invalid credentials"));

        let page = render_login_form("tok123", "/", None);
        assert!(!page.contains("class=\"error\""));
    }
}
