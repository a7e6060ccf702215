//! Peer Listener
//!
//! Accepts links from nodes that want to join this one. Each accepted link
//! is handed to the coordinator as an inbound channel; admission is decided
//! there once the channel reports `Opened`.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::cluster::NodeEvent;
use crate::protocol::{read_frame, write_frame};
use crate::remote::{ChannelId, RemoteError};

use super::tcp::{drive, TcpChannel};
use super::{configure_stream, Handshake, TransportConfig, PROTOCOL_VERSION};

pub struct PeerListener {
    listener: TcpListener,
    mailbox: mpsc::Sender<NodeEvent>,
    config: TransportConfig,
}

impl PeerListener {
    pub async fn bind(
        addr: SocketAddr,
        mailbox: mpsc::Sender<NodeEvent>,
        config: TransportConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            mailbox,
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept links until the node mailbox closes
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Peer listener on {}", addr);
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Incoming peer connection from {}", addr);
                    let mailbox = self.mailbox.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = accept_peer(stream, mailbox, config).await {
                            debug!("Incoming peer connection from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept peer connection: {}", e);
                }
            }
            if self.mailbox.is_closed() {
                return;
            }
        }
    }
}

/// Complete the listener side of the handshake and run the link
async fn accept_peer(
    mut stream: TcpStream,
    mailbox: mpsc::Sender<NodeEvent>,
    config: TransportConfig,
) -> Result<(), RemoteError> {
    configure_stream(&stream, &config).map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;

    let hello = tokio::time::timeout(
        config.connect_timeout,
        read_frame(&mut stream, config.max_frame_size),
    )
    .await
    .map_err(|_| RemoteError::Timeout)?
    .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?
    .ok_or_else(|| RemoteError::ConnectionLost("Connection closed".to_string()))?;

    let remote_id = match Handshake::decode(&hello) {
        Ok(Handshake::Hello { node_id, version }) if version == PROTOCOL_VERSION => node_id,
        Ok(Handshake::Hello { version, .. }) => {
            let reason = format!(
                "Protocol version mismatch: {} vs {}",
                version, PROTOCOL_VERSION
            );
            refuse(&mut stream, &reason).await;
            return Err(RemoteError::Rejected(reason));
        }
        Ok(_) => return Err(RemoteError::Other("Expected Hello".to_string())),
        Err(e) => return Err(RemoteError::Other(format!("Decode error: {}", e))),
    };

    let ack = Handshake::HelloAck {
        version: PROTOCOL_VERSION,
    }
    .encode()
    .map_err(|e| RemoteError::Other(e.to_string()))?;
    write_frame(&mut stream, &ack)
        .await
        .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;

    let id = ChannelId::next();
    debug!("Peer '{}' linked as {}", remote_id, id);
    let (channel, queue) = TcpChannel::new(id, remote_id);
    mailbox
        .send(NodeEvent::Inbound { channel })
        .await
        .map_err(|_| RemoteError::ChannelClosed)?;

    drive(stream, id, queue, mailbox, config.max_frame_size).await;
    Ok(())
}

async fn refuse(stream: &mut TcpStream, reason: &str) {
    if let Ok(framed) = (Handshake::Refused {
        reason: reason.to_string(),
    })
    .encode()
    {
        let _ = write_frame(stream, &framed).await;
    }
}
