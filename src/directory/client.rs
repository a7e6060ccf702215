//! Directory Client
//!
//! [`TcpDirectory`] keeps one session with the directory server per
//! registration. The session task owns the socket: it registers, then serves
//! lookups for outgoing links until the server goes away, at which point the
//! node is told its registration was lost.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::NodeEvent;
use crate::config::DirectoryConfig;
use crate::protocol::{read_frame, write_frame};
use crate::remote::{
    Channel, ChannelEvent, ChannelId, Directory, DirectoryEvent, DirectoryFault, RemoteError,
};
use crate::transport::{dial, drive, TcpChannel, TransportConfig};

use super::protocol::{decode, encode, DirectoryRequest, DirectoryResponse, RejectKind};

/// Largest response the client reads
const MAX_RESPONSE_SIZE: usize = 4096;

/// Requests served by a live session
#[derive(Debug)]
enum SessionRequest {
    Lookup {
        id: String,
        reply: oneshot::Sender<Result<SocketAddr, RemoteError>>,
    },
    Unregister {
        reply: oneshot::Sender<()>,
    },
}

struct Session {
    requests: mpsc::Sender<SessionRequest>,
    task: JoinHandle<()>,
}

/// State shared with session tasks
#[derive(Debug, Default)]
struct Shared {
    /// Identifier of the live registration
    registered: RwLock<Option<String>>,
    /// Bumped on every register/release; stale sessions stay silent
    generation: AtomicU64,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Directory client over TCP
pub struct TcpDirectory {
    config: DirectoryConfig,
    transport: TransportConfig,
    advertise: SocketAddr,
    mailbox: mpsc::Sender<NodeEvent>,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl TcpDirectory {
    /// `advertise` is the peer address published for this node
    pub fn new(
        config: DirectoryConfig,
        transport: TransportConfig,
        advertise: SocketAddr,
        mailbox: mpsc::Sender<NodeEvent>,
    ) -> Self {
        Self {
            config,
            transport,
            advertise,
            mailbox,
            shared: Arc::new(Shared::default()),
            session: Mutex::new(None),
        }
    }

    /// Identifier of the live registration, if any
    pub fn registered_id(&self) -> Option<String> {
        self.shared.registered.read().clone()
    }
}

#[async_trait]
impl Directory for TcpDirectory {
    fn register(&self, preferred_id: Option<String>) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.registered.write() = None;

        let (requests, rx) = mpsc::channel(16);
        let task = SessionTask {
            address: self.config.address.clone(),
            request_timeout: self.config.request_timeout,
            advertise: self.advertise,
            preferred_id,
            generation,
            shared: self.shared.clone(),
            mailbox: self.mailbox.clone(),
        };
        let task = tokio::spawn(task.run(rx));

        if let Some(old) = self.session.lock().replace(Session { requests, task }) {
            old.task.abort();
        }
    }

    fn connect(&self, target_id: &str, channel_id: ChannelId) -> Arc<dyn Channel> {
        let (channel, queue) = TcpChannel::new(channel_id, target_id);

        let requests = self.session.lock().as_ref().map(|s| s.requests.clone());
        let local_id = self.registered_id();
        let target = target_id.to_string();
        let transport = self.transport.clone();
        let request_timeout = self.config.request_timeout;
        let mailbox = self.mailbox.clone();

        tokio::spawn(async move {
            let result = async {
                let (requests, local_id) = match (requests, local_id) {
                    (Some(requests), Some(local_id)) => (requests, local_id),
                    _ => return Err(RemoteError::Other("Not registered with directory".into())),
                };
                let addr = lookup(&requests, &target, request_timeout).await?;
                debug!("Resolved node '{}' to {}", target, addr);
                dial(addr, &local_id, &transport).await
            }
            .await;

            match result {
                Ok(stream) => {
                    drive(stream, channel_id, queue, mailbox, transport.max_frame_size).await;
                }
                Err(e) => {
                    debug!("Link to node '{}' failed: {}", target, e);
                    let _ = mailbox
                        .send(NodeEvent::Channel {
                            id: channel_id,
                            event: ChannelEvent::Errored(e.to_string()),
                        })
                        .await;
                }
            }
        });

        channel
    }

    async fn release(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        *self.shared.registered.write() = None;

        let session = self.session.lock().take();
        if let Some(session) = session {
            let (reply, done) = oneshot::channel();
            if session
                .requests
                .send(SessionRequest::Unregister { reply })
                .await
                .is_ok()
            {
                let _ = tokio::time::timeout(self.config.request_timeout, done).await;
            }
            session.task.abort();
        }
    }
}

async fn lookup(
    requests: &mpsc::Sender<SessionRequest>,
    id: &str,
    timeout: Duration,
) -> Result<SocketAddr, RemoteError> {
    let (reply, rx) = oneshot::channel();
    requests
        .send(SessionRequest::Lookup {
            id: id.to_string(),
            reply,
        })
        .await
        .map_err(|_| RemoteError::ConnectionLost("Directory session closed".into()))?;
    tokio::time::timeout(timeout, rx)
        .await
        .map_err(|_| RemoteError::Timeout)?
        .map_err(|_| RemoteError::ConnectionLost("Directory session closed".into()))?
}

enum Next {
    Request(Option<SessionRequest>),
    Response(Option<DirectoryResponse>),
}

struct SessionTask {
    address: String,
    request_timeout: Duration,
    advertise: SocketAddr,
    preferred_id: Option<String>,
    generation: u64,
    shared: Arc<Shared>,
    mailbox: mpsc::Sender<NodeEvent>,
}

impl SessionTask {
    async fn run(self, mut requests: mpsc::Receiver<SessionRequest>) {
        let (stream, id) = match self.establish().await {
            Ok(registered) => registered,
            Err(fault) => {
                warn!("Directory registration failed: {}", fault);
                self.emit(DirectoryEvent::Failed(fault)).await;
                return;
            }
        };

        if !self.shared.is_current(self.generation) {
            return;
        }
        info!("Registered with directory as '{}'", id);
        *self.shared.registered.write() = Some(id.clone());
        self.emit(DirectoryEvent::Registered(id)).await;

        let (mut read_half, mut write_half) = stream.into_split();
        let (response_tx, mut responses) = mpsc::channel(8);
        let reader = tokio::spawn(async move {
            while let Ok(Some(body)) = read_frame(&mut read_half, MAX_RESPONSE_SIZE).await {
                match decode::<DirectoryResponse>(&body) {
                    Ok(response) => {
                        if response_tx.send(response).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("Malformed directory response: {}", e);
                        return;
                    }
                }
            }
        });

        loop {
            let next = tokio::select! {
                request = requests.recv() => Next::Request(request),
                response = responses.recv() => Next::Response(response),
            };
            match next {
                Next::Request(Some(SessionRequest::Lookup { id, reply })) => {
                    let request = DirectoryRequest::Lookup { id };
                    match self.exchange(&mut write_half, &mut responses, request).await {
                        Ok(DirectoryResponse::Found { addr, .. }) => {
                            let _ = reply.send(Ok(addr));
                        }
                        Ok(DirectoryResponse::NotFound { id }) => {
                            let _ = reply.send(Err(RemoteError::Rejected(format!(
                                "Node {} not found",
                                id
                            ))));
                        }
                        Ok(other) => {
                            let _ = reply.send(Err(RemoteError::Other(format!(
                                "Unexpected directory response: {:?}",
                                other
                            ))));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e.clone()));
                            self.lost(&e.to_string()).await;
                            break;
                        }
                    }
                }
                Next::Request(Some(SessionRequest::Unregister { reply })) => {
                    let _ = self
                        .exchange(&mut write_half, &mut responses, DirectoryRequest::Unregister)
                        .await;
                    let _ = reply.send(());
                    break;
                }
                Next::Request(None) => break,
                Next::Response(Some(response)) => {
                    debug!("Ignoring unsolicited directory response {:?}", response);
                }
                Next::Response(None) => {
                    self.lost("Directory closed the session").await;
                    break;
                }
            }
        }
        reader.abort();
    }

    /// Connect and register, classifying failures
    async fn establish(&self) -> Result<(TcpStream, String), DirectoryFault> {
        let mut stream = tokio::time::timeout(
            self.request_timeout,
            TcpStream::connect(self.address.as_str()),
        )
        .await
        .map_err(|_| DirectoryFault::Transient("Connection to directory timed out".into()))?
        .map_err(|e| {
            DirectoryFault::Transient(format!("Cannot reach directory at {}: {}", self.address, e))
        })?;
        let _ = stream.set_nodelay(true);

        let request = encode(&DirectoryRequest::Register {
            id: self.preferred_id.clone(),
            addr: self.advertise,
        })
        .map_err(|e| DirectoryFault::Fatal(e.to_string()))?;
        write_frame(&mut stream, &request)
            .await
            .map_err(|e| DirectoryFault::Transient(e.to_string()))?;

        let body = tokio::time::timeout(
            self.request_timeout,
            read_frame(&mut stream, MAX_RESPONSE_SIZE),
        )
        .await
        .map_err(|_| DirectoryFault::Transient("Directory did not answer".into()))?
        .map_err(|e| DirectoryFault::Transient(e.to_string()))?
        .ok_or_else(|| DirectoryFault::Transient("Directory closed the session".into()))?;

        match decode::<DirectoryResponse>(&body) {
            Ok(DirectoryResponse::Registered { id }) => Ok((stream, id)),
            Ok(DirectoryResponse::Rejected {
                kind: RejectKind::IdTaken,
                ..
            }) => Err(DirectoryFault::IdTaken(
                self.preferred_id.clone().unwrap_or_default(),
            )),
            Ok(DirectoryResponse::Rejected {
                kind: RejectKind::InvalidId,
                message,
            }) => Err(DirectoryFault::Fatal(message)),
            Ok(other) => Err(DirectoryFault::Fatal(format!(
                "Unexpected directory response: {:?}",
                other
            ))),
            Err(e) => Err(DirectoryFault::Fatal(e.to_string())),
        }
    }

    /// One request/response round trip on the live session
    async fn exchange(
        &self,
        writer: &mut OwnedWriteHalf,
        responses: &mut mpsc::Receiver<DirectoryResponse>,
        request: DirectoryRequest,
    ) -> Result<DirectoryResponse, RemoteError> {
        let framed = encode(&request).map_err(|e| RemoteError::Other(e.to_string()))?;
        write_frame(writer, &framed)
            .await
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;
        tokio::time::timeout(self.request_timeout, responses.recv())
            .await
            .map_err(|_| RemoteError::Timeout)?
            .ok_or_else(|| RemoteError::ConnectionLost("Directory closed the session".into()))
    }

    async fn lost(&self, reason: &str) {
        if !self.shared.is_current(self.generation) {
            return;
        }
        warn!("Directory registration lost: {}", reason);
        *self.shared.registered.write() = None;
        self.emit(DirectoryEvent::Lost).await;
    }

    async fn emit(&self, event: DirectoryEvent) {
        if self.shared.is_current(self.generation) {
            let _ = self.mailbox.send(NodeEvent::Directory(event)).await;
        }
    }
}
