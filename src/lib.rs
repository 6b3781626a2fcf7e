//! ibkr-proxy: a REST front end for one Interactive Brokers TWS/Gateway
//! session.
//!
//! Browser clients cannot speak the gateway's socket protocol, so this crate
//! keeps a single long-lived session open and turns its asynchronous,
//! id-correlated callbacks into plain request/response HTTP calls.
//!
//! ## Modules
//!
//! - [`config`] -- command-line arguments and validated configuration
//! - [`error`] -- error taxonomy and HTTP mapping
//! - [`correlation`] -- request id to pending result slot
//! - [`router`] -- demultiplexes gateway events into the correlation tables
//! - [`gateway`] -- connector/link traits and the TWS socket implementation
//! - [`session`] -- connection state machine, reconnect and health check
//! - [`dispatcher`] -- typed gateway operations and the dynamic allow-list
//! - [`paginator`] -- windowed historical bar retrieval
//! - [`models`] -- JSON response shapes
//! - [`web`] -- axum routes

use std::sync::Arc;

pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod models;
pub mod paginator;
pub mod router;
pub mod session;
pub mod web;

pub use config::{Args, ConfigError, ProxyConfig};
pub use error::{ProxyError, Result};

use dispatcher::Dispatcher;
use gateway::GatewayConnector;
use paginator::Paginator;
use session::SessionManager;
use web::AppState;

/// Wire the session, dispatcher and paginator together for `config`.
pub fn build_state(config: &ProxyConfig, connector: Arc<dyn GatewayConnector>) -> AppState {
    let session = SessionManager::new(config.session.clone(), connector);
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&session), config.timeouts.clone()));
    let paginator = Arc::new(Paginator::new(
        dispatcher.clone(),
        config.windows.clone(),
        config.paginator.clone(),
    ));
    AppState {
        session,
        dispatcher,
        paginator,
        proxy_host: config.proxy_host.clone(),
        proxy_port: config.proxy_port,
    }
}
