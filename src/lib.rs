//! Agentgate - a dispatcher for per-user mail-agent instances
//!
//! This library multiplexes isolated per-user agent backends behind a single
//! control plane and an authenticating reverse proxy:
//! - Tracks instances as a directory-per-user layout with salted credentials
//! - Materializes instances as forked subprocesses or Docker containers
//! - Allocates local ports and gates starts on available memory
//! - Exposes a RESTful control surface for add/remove/start/stop/status
//! - Authenticates browsers via session cookie and lazily starts a stopped
//!   backend on first request, forwarding traffic once it is healthy

pub mod api;
pub mod auth;
pub mod backend;
pub mod client;
pub mod config;
pub mod docker;
pub mod error;
pub mod fork;
pub mod ports;
pub mod provider;
pub mod proxy;
pub mod registry;
pub mod session;
