//! Async TCP transport: length-prefixed framing and the connection handshake.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::decoder::MessageDecoder;
use crate::encoder::{build_connect_request, FrameBuilder};
use crate::errors::{Result, WireError};
use crate::protocol::{outgoing, HEADER_LEN, MAX_CLIENT_VER, MAX_MSG_LEN, MIN_CLIENT_VER};

// ============================================================================
// Framing
// ============================================================================

/// Read one complete frame from `reader`, buffering partial reads in `buf`.
///
/// Returns the message body without its length header.
async fn read_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < HEADER_LEN {
        if reader.read_buf(buf).await? == 0 {
            return Err(WireError::Disconnected(
                "connection closed while reading message header".into(),
            ));
        }
    }

    let mut len_bytes = [0u8; HEADER_LEN];
    len_bytes.copy_from_slice(&buf[..HEADER_LEN]);
    let msg_len = u32::from_be_bytes(len_bytes) as usize;
    if msg_len == 0 || msg_len > MAX_MSG_LEN {
        return Err(WireError::Protocol(format!(
            "invalid message length: {msg_len}"
        )));
    }

    while buf.len() < HEADER_LEN + msg_len {
        if reader.read_buf(buf).await? == 0 {
            return Err(WireError::Disconnected(
                "connection closed while reading message body".into(),
            ));
        }
    }

    buf.advance(HEADER_LEN);
    Ok(buf.split_to(msg_len).to_vec())
}

// ============================================================================
// Transport
// ============================================================================

/// A connected, handshaken socket to TWS/Gateway.
pub struct Transport {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    server_version: i32,
    tws_time: String,
}

impl Transport {
    /// Open the TCP connection and run the version handshake.
    ///
    /// Call [`Transport::start_api`] afterwards to register the client id.
    pub async fn connect(host: &str, port: u16, connect_options: Option<&str>) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| WireError::Connection(format!("failed to connect to {addr}: {e}")))?;
        // Requests are small and latency bound.
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let mut transport = Self {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(8192),
            server_version: 0,
            tws_time: String::new(),
        };

        let hello = build_connect_request(connect_options)?;
        transport
            .writer
            .write_all(&hello)
            .await
            .map_err(|e| WireError::Connection(format!("failed to send connect request: {e}")))?;

        transport.process_connect_ack().await?;
        Ok(transport)
    }

    /// Server answers `[server_version][tws_time]`, or a negative version
    /// followed by `host:port` when redirecting.
    async fn process_connect_ack(&mut self) -> Result<()> {
        let msg = self.read_message().await?;
        let mut dec = MessageDecoder::new(&msg, 0);

        let sv = dec.decode_i32()?;
        if sv < 0 {
            let hostport = dec.decode_string()?;
            return Err(WireError::Redirect(hostport));
        }
        if !(MIN_CLIENT_VER..=MAX_CLIENT_VER).contains(&sv) {
            return Err(WireError::UnsupportedServerVersion {
                version: sv,
                min: MIN_CLIENT_VER,
                max: MAX_CLIENT_VER,
            });
        }

        self.tws_time = dec.decode_string()?;
        self.server_version = sv;

        tracing::info!(
            server_version = sv,
            tws_time = %self.tws_time,
            "IB TWS API handshake complete"
        );
        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.reader, &mut self.read_buf).await
    }

    pub async fn send_message(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| WireError::Connection(format!("failed to send message: {e}")))
    }

    /// Send START_API: version 2, client id, optional capabilities.
    pub async fn start_api(&mut self, client_id: i32, optional_capabilities: Option<&str>) -> Result<()> {
        let mut frame = FrameBuilder::new(outgoing::START_API);
        frame
            .push(&2i32)
            .push(&client_id)
            .push(optional_capabilities.unwrap_or(""));
        let bytes = frame.finish()?;
        self.send_message(&bytes).await
    }

    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    pub fn tws_time(&self) -> &str {
        &self.tws_time
    }

    /// Split into halves for a dedicated reader task.
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        (
            TransportReader {
                reader: self.reader,
                read_buf: self.read_buf,
            },
            TransportWriter {
                writer: self.writer,
            },
        )
    }
}

// ============================================================================
// Split halves
// ============================================================================

/// Read half of a split transport.
pub struct TransportReader {
    reader: OwnedReadHalf,
    read_buf: BytesMut,
}

impl TransportReader {
    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.reader, &mut self.read_buf).await
    }
}

/// Write half of a split transport.
pub struct TransportWriter {
    writer: OwnedWriteHalf,
}

impl TransportWriter {
    pub async fn send_message(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| WireError::Connection(format!("failed to send: {e}")))
    }

    /// Send FIN; the server then closes and the reader sees EOF.
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn build_framed_response(fields: &[&str]) -> Vec<u8> {
        let mut body = Vec::new();
        for f in fields {
            body.extend_from_slice(f.as_bytes());
            body.push(0);
        }
        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend(body);
        frame
    }

    /// Mock gateway: accept one connection, read the hello, answer `reply`,
    /// then return whatever the client sends next.
    async fn mock_gateway(reply: Vec<u8>) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(&reply).await.unwrap();
            let mut next = vec![0u8; 256];
            let n = stream.read(&mut next).await.unwrap_or(0);
            next.truncate(n);
            next
        });
        (port, handle)
    }

    #[tokio::test]
    async fn connect_and_handshake() {
        let (port, _h) = mock_gateway(build_framed_response(&["176", "20260101 12:00:00 EST"])).await;
        let transport = Transport::connect("127.0.0.1", port, None).await.unwrap();
        assert_eq!(transport.server_version(), 176);
        assert_eq!(transport.tws_time(), "20260101 12:00:00 EST");
    }

    #[tokio::test]
    async fn connect_rejects_versions_outside_range() {
        for sv in ["50", "201"] {
            let (port, _h) = mock_gateway(build_framed_response(&[sv, "time"])).await;
            match Transport::connect("127.0.0.1", port, None).await {
                Err(WireError::UnsupportedServerVersion { version, .. }) => {
                    assert_eq!(version.to_string(), sv)
                }
                Err(e) => panic!("unexpected error {e}"),
                Ok(_) => panic!("expected error for server version {sv}"),
            }
        }
    }

    #[tokio::test]
    async fn connect_reports_redirect() {
        let (port, _h) = mock_gateway(build_framed_response(&["-1", "10.0.0.1:4002"])).await;
        match Transport::connect("127.0.0.1", port, None).await {
            Err(WireError::Redirect(target)) => assert_eq!(target, "10.0.0.1:4002"),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("expected redirect error"),
        }
    }

    #[tokio::test]
    async fn connect_refused() {
        assert!(Transport::connect("127.0.0.1", 1, None).await.is_err());
    }

    #[tokio::test]
    async fn read_fragmented_frames() {
        let mut reply = build_framed_response(&["176", "t"]);
        reply.extend(build_framed_response(&["49", "1", "1700000000"]));
        let (port, _h) = mock_gateway(reply).await;

        let mut transport = Transport::connect("127.0.0.1", port, None).await.unwrap();
        let msg = transport.read_message().await.unwrap();
        let mut dec = MessageDecoder::new(&msg, 176);
        assert_eq!(dec.decode_i32().unwrap(), 49);
        assert_eq!(dec.decode_i32().unwrap(), 1);
        assert_eq!(dec.decode_i64().unwrap(), 1700000000);
    }

    #[tokio::test]
    async fn start_api_message() {
        let (port, handle) = mock_gateway(build_framed_response(&["176", "t"])).await;
        let mut transport = Transport::connect("127.0.0.1", port, None).await.unwrap();
        transport.start_api(3, None).await.unwrap();

        let received = handle.await.unwrap();
        let mut dec = MessageDecoder::new(&received[HEADER_LEN..], 176);
        assert_eq!(dec.decode_i32().unwrap(), 71);
        assert_eq!(dec.decode_i32().unwrap(), 2);
        assert_eq!(dec.decode_i32().unwrap(), 3);
        assert_eq!(dec.decode_string().unwrap(), "");
    }

    #[tokio::test]
    async fn zero_length_frame_is_a_protocol_error() {
        let mut reply = build_framed_response(&["176", "t"]);
        reply.extend_from_slice(&0u32.to_be_bytes());
        let (port, _h) = mock_gateway(reply).await;
        let mut transport = Transport::connect("127.0.0.1", port, None).await.unwrap();
        assert!(matches!(
            transport.read_message().await,
            Err(WireError::Protocol(_))
        ));
    }
}
