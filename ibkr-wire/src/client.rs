//! `WireClient`, the connection entry point.
//!
//! `connect` performs the handshake and START_API, then hands the read half
//! to a background [`MessageReader`]. Requests go out through [`WireClient::send`];
//! replies arrive on the returned event receiver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::{Result, WireError};
use crate::events::GatewayEvent;
use crate::reader::MessageReader;
use crate::request::GatewayRequest;
use crate::transport::{Transport, TransportWriter};

/// How long `disconnect` lets the reader drain before aborting it.
const READER_DRAIN: Duration = Duration::from_secs(2);

/// An open session with TWS/Gateway.
///
/// ```rust,ignore
/// let (mut client, mut rx) = WireClient::connect("127.0.0.1", 7497, 1).await?;
/// client.send(&GatewayRequest::CurrentTime).await?;
/// while let Some(event) = rx.recv().await {
///     println!("{event:?}");
/// }
/// ```
pub struct WireClient {
    writer: TransportWriter,
    server_version: i32,
    tws_time: String,
    client_id: i32,
    connected: AtomicBool,
    reader_handle: Option<JoinHandle<()>>,
}

impl WireClient {
    pub async fn connect(
        host: &str,
        port: u16,
        client_id: i32,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GatewayEvent>)> {
        let mut transport = Transport::connect(host, port, None).await?;
        let server_version = transport.server_version();
        let tws_time = transport.tws_time().to_string();

        tracing::info!(server_version, client_id, "starting IB API session");
        transport.start_api(client_id, None).await?;

        let (transport_reader, transport_writer) = transport.into_split();
        let (rx, reader_handle) = MessageReader::new(transport_reader, server_version).spawn();

        let client = Self {
            writer: transport_writer,
            server_version,
            tws_time,
            client_id,
            connected: AtomicBool::new(true),
            reader_handle: Some(reader_handle),
        };
        Ok((client, rx))
    }

    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    pub fn tws_time(&self) -> &str {
        &self.tws_time
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Encode `request` for the negotiated server version and write it.
    pub async fn send(&mut self, request: &GatewayRequest) -> Result<()> {
        if !self.is_connected() {
            return Err(WireError::Connection("not connected".into()));
        }
        let bytes = request.encode(self.server_version)?;
        tracing::trace!(request = request.name(), req_id = ?request.req_id(), "sending request");
        self.writer.send_message(&bytes).await
    }

    /// Close the write half and give the reader [`READER_DRAIN`] to see the
    /// gateway hang up; a gateway that keeps its side open gets the reader
    /// aborted. Idempotent.
    pub async fn disconnect(&mut self) {
        if !self.connected.swap(false, Ordering::Relaxed) {
            return;
        }
        tracing::info!("closing IB API session");
        self.writer.shutdown().await;
        if let Some(mut handle) = self.reader_handle.take() {
            if tokio::time::timeout(READER_DRAIN, &mut handle).await.is_err() {
                tracing::debug!(drain = ?READER_DRAIN, "gateway kept the socket open, aborting reader");
                handle.abort();
            }
        }
    }
}
