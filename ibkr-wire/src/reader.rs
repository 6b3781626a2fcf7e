//! Background reader task.
//!
//! Reads frames from the [`TransportReader`], decodes them into
//! [`GatewayEvent`]s and forwards them over an unbounded mpsc channel.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::decoder::decode_server_msg;
use crate::errors::WireError;
use crate::events::GatewayEvent;
use crate::transport::TransportReader;

pub struct MessageReader {
    transport_reader: TransportReader,
    server_version: i32,
}

impl MessageReader {
    pub fn new(transport_reader: TransportReader, server_version: i32) -> Self {
        Self {
            transport_reader,
            server_version,
        }
    }

    /// Spawn the read loop. It ends after emitting `ConnectionClosed`, or
    /// quietly once the receiver is dropped.
    pub fn spawn(self) -> (mpsc::UnboundedReceiver<GatewayEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            self.run(tx).await;
        });
        (rx, handle)
    }

    async fn run(mut self, tx: mpsc::UnboundedSender<GatewayEvent>) {
        loop {
            match self.transport_reader.read_message().await {
                Ok(msg) => {
                    let event = decode_server_msg(&msg, self.server_version);
                    if tx.send(event).is_err() {
                        tracing::debug!("event receiver dropped, reader stopping");
                        break;
                    }
                }
                Err(WireError::Disconnected(reason)) => {
                    tracing::info!("server disconnected: {reason}");
                    let _ = tx.send(GatewayEvent::ConnectionClosed);
                    break;
                }
                Err(e) => {
                    tracing::error!("reader error: {e}");
                    let _ = tx.send(GatewayEvent::ConnectionClosed);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn build_framed_msg(fields: &[&str]) -> Vec<u8> {
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

    /// Mock gateway that completes the handshake, sends `messages`, then closes.
    async fn mock_gateway_with_messages(messages: Vec<Vec<u8>>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 512];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(&build_framed_msg(&["176", "20260101 12:00:00"]))
                .await
                .unwrap();
            for msg in messages {
                stream.write_all(&msg).await.unwrap();
            }
        });

        port
    }

    async fn spawn_reader(port: u16) -> (mpsc::UnboundedReceiver<GatewayEvent>, JoinHandle<()>) {
        let transport = Transport::connect("127.0.0.1", port, None).await.unwrap();
        let sv = transport.server_version();
        let (reader_half, _writer_half) = transport.into_split();
        MessageReader::new(reader_half, sv).spawn()
    }

    #[tokio::test]
    async fn reader_decodes_events_then_reports_close() {
        let port = mock_gateway_with_messages(vec![
            build_framed_msg(&["9", "1", "100"]),
            build_framed_msg(&["15", "1", "DU123"]),
        ])
        .await;

        let (mut rx, handle) = spawn_reader(port).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        handle.await.unwrap();

        assert_eq!(
            events,
            vec![
                GatewayEvent::NextValidId { order_id: 100 },
                GatewayEvent::ManagedAccounts {
                    accounts: "DU123".into()
                },
                GatewayEvent::ConnectionClosed,
            ]
        );
    }

    #[tokio::test]
    async fn reader_stops_when_receiver_dropped() {
        let port = mock_gateway_with_messages(vec![
            build_framed_msg(&["9", "1", "100"]),
            build_framed_msg(&["9", "1", "101"]),
        ])
        .await;

        let (rx, handle) = spawn_reader(port).await;
        drop(rx);
        handle.await.unwrap();
    }
}
