//! The seam between the session and the gateway socket.
//!
//! [`GatewayConnector`] opens links, [`GatewayLink`] sends requests on one.
//! Events come back on the receiver returned by `connect`. Production uses
//! [`TwsConnector`] over `ibkr-wire`; tests substitute an in-process fake.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ibkr_wire::{GatewayEvent, GatewayRequest, WireClient};
use tokio::sync::{mpsc, Mutex};

use crate::error::{ProxyError, Result};

/// Where the gateway listens and which client id to register as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
}

impl fmt::Display for GatewayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (client {})", self.host, self.port, self.client_id)
    }
}

/// One open connection.
#[async_trait]
pub trait GatewayLink: Send + Sync {
    async fn send(&self, request: GatewayRequest) -> Result<()>;

    /// Close the connection. Must be idempotent.
    async fn disconnect(&self);

    fn server_version(&self) -> i32;
}

pub type GatewayEvents = mpsc::UnboundedReceiver<GatewayEvent>;

#[async_trait]
pub trait GatewayConnector: Send + Sync {
    async fn connect(&self, endpoint: &GatewayEndpoint) -> Result<(Arc<dyn GatewayLink>, GatewayEvents)>;
}

// ============================================================================
// TWS socket implementation
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct TwsConnector;

#[async_trait]
impl GatewayConnector for TwsConnector {
    async fn connect(&self, endpoint: &GatewayEndpoint) -> Result<(Arc<dyn GatewayLink>, GatewayEvents)> {
        let (client, events) = WireClient::connect(&endpoint.host, endpoint.port, endpoint.client_id)
            .await
            .map_err(|e| ProxyError::Connection(e.to_string()))?;
        let server_version = client.server_version();
        let link = TwsLink {
            client: Mutex::new(client),
            server_version,
        };
        Ok((Arc::new(link), events))
    }
}

pub struct TwsLink {
    client: Mutex<WireClient>,
    server_version: i32,
}

#[async_trait]
impl GatewayLink for TwsLink {
    async fn send(&self, request: GatewayRequest) -> Result<()> {
        let mut client = self.client.lock().await;
        if !client.is_connected() {
            return Err(ProxyError::ConnectionLost);
        }
        client.send(&request).await.map_err(|e| {
            tracing::warn!(request = request.name(), error = %e, "send failed");
            ProxyError::from(e)
        })
    }

    async fn disconnect(&self) {
        self.client.lock().await.disconnect().await;
    }

    fn server_version(&self) -> i32 {
        self.server_version
    }
}
