//! Node
//!
//! Assembles a running cluster node: peer listener, directory client and
//! coordinator, all sharing one mailbox.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cluster::{Coordinator, CoordinatorConfig, NodeHandle};
use crate::config::Config;
use crate::directory::TcpDirectory;
use crate::transport::{PeerListener, TransportConfig};

pub struct Node {
    handle: NodeHandle,
    peer_addr: SocketAddr,
    coordinator: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl Node {
    /// Bind the peer listener and start the coordinator
    pub async fn start(config: &Config) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel(config.node.mailbox_capacity);
        let transport = TransportConfig::from(config);

        let listener =
            PeerListener::bind(config.node.listen, tx.clone(), transport.clone()).await?;
        let bound = listener.local_addr()?;

        // Publish the port actually bound (the configured one may be 0)
        let mut node_config = config.node.clone();
        node_config.listen = bound;
        let advertise = node_config.advertise_addr();

        let directory = Arc::new(TcpDirectory::new(
            config.directory.clone(),
            transport,
            advertise,
            tx.clone(),
        ));
        let coordinator = Coordinator::new(CoordinatorConfig::from(config), directory, tx.clone());
        let (handle, coordinator) = NodeHandle::spawn(coordinator, tx, rx);
        let listener = tokio::spawn(listener.run());

        info!("Node started");
        info!("  Peer address: {} (advertised as {})", bound, advertise);
        info!("  Directory: {}", config.directory.address);
        info!("  Max children: {}", config.cluster.max_children);

        Ok(Self {
            handle,
            peer_addr: bound,
            coordinator,
            listener,
        })
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    /// Address the peer listener is bound to
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Leave the cluster, release the registration and stop all tasks
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        self.listener.abort();
        let _ = self.coordinator.await;
        info!("Node stopped");
    }
}
