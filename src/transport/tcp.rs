//! TCP Channel
//!
//! [`TcpChannel`] is the handle the coordinator holds; a driver task owns the
//! socket. Sends and closes are queued on an unbounded queue so they never
//! block the coordinator, and the driver reports `Opened`, `Data` and one
//! terminal event into the node mailbox.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cluster::NodeEvent;
use crate::protocol::{frame, read_frame, write_frame};
use crate::remote::{Channel, ChannelEvent, ChannelId, RemoteError};

use super::{configure_stream, Handshake, TransportConfig, PROTOCOL_VERSION};

#[derive(Debug)]
enum Outbound {
    /// Already framed message
    Frame(Bytes),
    /// Flush and shut down
    Close,
}

/// Receiving end of a channel's send queue, consumed by [`drive`]
#[derive(Debug)]
pub struct OutboundQueue(mpsc::UnboundedReceiver<Outbound>);

/// Handle to a TCP link with one remote node
#[derive(Debug)]
pub struct TcpChannel {
    id: ChannelId,
    remote_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl TcpChannel {
    /// Create a channel handle and the queue its driver will consume
    pub fn new(id: ChannelId, remote_id: impl Into<String>) -> (Arc<Self>, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            id,
            remote_id: remote_id.into(),
            tx,
        });
        (channel, OutboundQueue(rx))
    }
}

impl Channel for TcpChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn send(&self, body: Bytes) -> Result<(), RemoteError> {
        self.tx
            .send(Outbound::Frame(frame(&body)))
            .map_err(|_| RemoteError::ChannelClosed)
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Dial a peer and complete the handshake as `local_id`
pub async fn dial(
    addr: SocketAddr,
    local_id: &str,
    config: &TransportConfig,
) -> Result<TcpStream, RemoteError> {
    let mut stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| RemoteError::Timeout)?
        .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;
    configure_stream(&stream, config).map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;

    let hello = Handshake::Hello {
        node_id: local_id.to_string(),
        version: PROTOCOL_VERSION,
    }
    .encode()
    .map_err(|e| RemoteError::Other(format!("Encode error: {}", e)))?;
    write_frame(&mut stream, &hello)
        .await
        .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;

    let reply = tokio::time::timeout(
        config.connect_timeout,
        read_frame(&mut stream, config.max_frame_size),
    )
    .await
    .map_err(|_| RemoteError::Timeout)?
    .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?
    .ok_or_else(|| RemoteError::ConnectionLost("Connection closed".to_string()))?;

    let reply =
        Handshake::decode(&reply).map_err(|e| RemoteError::Other(format!("Decode error: {}", e)))?;
    match reply {
        Handshake::HelloAck { version } if version == PROTOCOL_VERSION => {
            debug!("Link to {} established", addr);
            Ok(stream)
        }
        Handshake::HelloAck { version } => Err(RemoteError::Rejected(format!(
            "Protocol version mismatch: {} vs {}",
            version, PROTOCOL_VERSION
        ))),
        Handshake::Refused { reason } => Err(RemoteError::Rejected(reason)),
        Handshake::Hello { .. } => Err(RemoteError::Other("Expected HelloAck".to_string())),
    }
}

/// Run an established link until either side closes it.
///
/// Emits `Opened` first, then `Data` for each received frame, then exactly
/// one of `Closed` / `Errored`.
pub async fn drive(
    stream: TcpStream,
    id: ChannelId,
    queue: OutboundQueue,
    mailbox: mpsc::Sender<NodeEvent>,
    max_frame_size: usize,
) {
    let OutboundQueue(mut outbound) = queue;
    let (mut read_half, mut write_half) = stream.into_split();

    if mailbox
        .send(NodeEvent::Channel {
            id,
            event: ChannelEvent::Opened,
        })
        .await
        .is_err()
    {
        return;
    }

    let reader_mailbox = mailbox.clone();
    let mut reader = tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half, max_frame_size).await {
                Ok(Some(body)) => {
                    let event = NodeEvent::Channel {
                        id,
                        event: ChannelEvent::Data(body),
                    };
                    if reader_mailbox.send(event).await.is_err() {
                        return ChannelEvent::Closed;
                    }
                }
                Ok(None) => return ChannelEvent::Closed,
                Err(e) => return ChannelEvent::Errored(e.to_string()),
            }
        }
    });

    let terminal = loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(framed)) => {
                    if let Err(e) = write_frame(&mut write_half, &framed).await {
                        break ChannelEvent::Errored(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = write_half.shutdown().await;
                    break ChannelEvent::Closed;
                }
            },
            result = &mut reader => {
                break result.unwrap_or_else(|e| ChannelEvent::Errored(e.to_string()));
            }
        }
    };
    reader.abort();

    debug!("{} finished: {:?}", id, terminal);
    let _ = mailbox
        .send(NodeEvent::Channel {
            id,
            event: terminal,
        })
        .await;
}
