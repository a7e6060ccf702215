//! Directory Server
//!
//! Rendezvous service mapping node identifiers to peer addresses. A node
//! keeps one TCP session open; its registration lives exactly as long as
//! that session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::protocol::{read_frame, write_frame, ProtocolError};
use crate::remote::generate_short_id;

use super::protocol::{
    decode, encode, is_valid_id, DirectoryRequest, DirectoryResponse, RejectKind,
};

/// Largest request the server reads
const MAX_REQUEST_SIZE: usize = 4096;

/// Attempts at finding a free identifier for an anonymous registration
const ASSIGN_ATTEMPTS: usize = 32;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy)]
struct Registration {
    addr: SocketAddr,
    session: u64,
}

/// Shared identifier table
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Arc<DashMap<String, Registration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, id: &str) -> Option<SocketAddr> {
        self.entries.get(id).map(|r| r.addr)
    }

    /// Claim `id` for `session`. Fails if another session holds it.
    fn claim(&self, id: &str, addr: SocketAddr, session: u64) -> bool {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut entry) if entry.get().session == session => {
                entry.get_mut().addr = addr;
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Registration { addr, session });
                true
            }
        }
    }

    /// Release `id` if `session` still holds it
    fn release(&self, id: &str, session: u64) {
        self.entries.remove_if(id, |_, r| r.session == session);
    }
}

pub struct DirectoryServer {
    listener: TcpListener,
    registry: Registry,
    id_digits: u32,
}

impl DirectoryServer {
    pub async fn bind(config: &ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        Ok(Self {
            listener,
            registry: Registry::new(),
            id_digits: config.id_digits,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Accept sessions forever
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Directory server listening on {}", addr);
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let registry = self.registry.clone();
                    let id_digits = self.id_digits;
                    tokio::spawn(async move {
                        let _ = stream.set_nodelay(true);
                        if let Err(e) = serve_session(stream, registry, id_digits).await {
                            debug!("Directory session from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept directory connection: {}", e);
                }
            }
        }
    }
}

async fn serve_session(
    mut stream: TcpStream,
    registry: Registry,
    id_digits: u32,
) -> Result<(), ProtocolError> {
    let session = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
    let mut registered: Option<String> = None;

    let result = async {
        while let Some(body) = read_frame(&mut stream, MAX_REQUEST_SIZE).await? {
            let request: DirectoryRequest = decode(&body)?;
            let response = handle_request(request, &registry, session, &mut registered, id_digits);
            write_frame(&mut stream, &encode(&response)?).await?;
        }
        Ok(())
    }
    .await;

    if let Some(id) = registered {
        info!("Node '{}' unregistered (session closed)", id);
        registry.release(&id, session);
    }
    result
}

fn handle_request(
    request: DirectoryRequest,
    registry: &Registry,
    session: u64,
    registered: &mut Option<String>,
    id_digits: u32,
) -> DirectoryResponse {
    match request {
        DirectoryRequest::Register { id, addr } => {
            if let Some(previous) = registered.take() {
                registry.release(&previous, session);
            }
            let id = match id {
                Some(id) if !is_valid_id(&id) => {
                    return DirectoryResponse::Rejected {
                        kind: RejectKind::InvalidId,
                        message: format!("'{}' is not a valid identifier", id),
                    };
                }
                Some(id) => {
                    if !registry.claim(&id, addr, session) {
                        return DirectoryResponse::Rejected {
                            kind: RejectKind::IdTaken,
                            message: format!("'{}' is already registered", id),
                        };
                    }
                    id
                }
                None => {
                    let assigned = (0..ASSIGN_ATTEMPTS)
                        .map(|_| generate_short_id(id_digits))
                        .find(|candidate| registry.claim(candidate, addr, session));
                    match assigned {
                        Some(id) => id,
                        None => {
                            return DirectoryResponse::Rejected {
                                kind: RejectKind::IdTaken,
                                message: "no free identifier".to_string(),
                            };
                        }
                    }
                }
            };
            info!("Node '{}' registered at {}", id, addr);
            *registered = Some(id.clone());
            DirectoryResponse::Registered { id }
        }
        DirectoryRequest::Lookup { id } => match registry.lookup(&id) {
            Some(addr) => DirectoryResponse::Found { id, addr },
            None => DirectoryResponse::NotFound { id },
        },
        DirectoryRequest::Unregister => {
            if let Some(id) = registered.take() {
                info!("Node '{}' unregistered", id);
                registry.release(&id, session);
            }
            DirectoryResponse::Unregistered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn register(
        registry: &Registry,
        session: u64,
        registered: &mut Option<String>,
        id: Option<&str>,
    ) -> DirectoryResponse {
        handle_request(
            DirectoryRequest::Register {
                id: id.map(str::to_string),
                addr: addr(7000 + session as u16),
            },
            registry,
            session,
            registered,
            4,
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new();
        let mut held = None;
        assert_eq!(
            register(&registry, 1, &mut held, Some("1234")),
            DirectoryResponse::Registered {
                id: "1234".to_string()
            }
        );
        assert_eq!(held.as_deref(), Some("1234"));
        assert_eq!(registry.lookup("1234"), Some(addr(7001)));
        assert_eq!(registry.lookup("9999"), None);
    }

    #[test]
    fn test_collision_is_rejected() {
        let registry = Registry::new();
        let (mut a, mut b) = (None, None);
        register(&registry, 1, &mut a, Some("1234"));
        let response = register(&registry, 2, &mut b, Some("1234"));
        assert!(matches!(
            response,
            DirectoryResponse::Rejected {
                kind: RejectKind::IdTaken,
                ..
            }
        ));
        assert!(b.is_none());
        assert_eq!(registry.lookup("1234"), Some(addr(7001)));
    }

    #[test]
    fn test_invalid_id_is_rejected() {
        let registry = Registry::new();
        let mut held = None;
        assert!(matches!(
            register(&registry, 1, &mut held, Some("not valid")),
            DirectoryResponse::Rejected {
                kind: RejectKind::InvalidId,
                ..
            }
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_anonymous_registration_gets_short_id() {
        let registry = Registry::new();
        let mut held = None;
        match register(&registry, 1, &mut held, None) {
            DirectoryResponse::Registered { id } => {
                assert_eq!(id.len(), 4);
                assert_eq!(registry.lookup(&id), Some(addr(7001)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reregistration_replaces_previous_id() {
        let registry = Registry::new();
        let mut held = None;
        register(&registry, 1, &mut held, Some("1111"));
        register(&registry, 1, &mut held, Some("2222"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("1111"), None);
    }

    #[test]
    fn test_release_only_removes_own_session() {
        let registry = Registry::new();
        let mut held = None;
        register(&registry, 1, &mut held, Some("1234"));
        registry.release("1234", 2);
        assert!(registry.lookup("1234").is_some());
        registry.release("1234", 1);
        assert!(registry.lookup("1234").is_none());
    }

    #[tokio::test]
    async fn test_session_close_releases_registration() {
        let server = DirectoryServer::bind(&ServerConfig {
            bind: addr(0),
            id_digits: 4,
        })
        .await
        .unwrap();
        let server_addr = server.local_addr().unwrap();
        let registry = server.registry();
        tokio::spawn(server.run());

        let mut stream = TcpStream::connect(server_addr).await.unwrap();
        let request = encode(&DirectoryRequest::Register {
            id: Some("4321".to_string()),
            addr: addr(9000),
        })
        .unwrap();
        write_frame(&mut stream, &request).await.unwrap();
        let body = read_frame(&mut stream, 1024).await.unwrap().unwrap();
        let response: DirectoryResponse = decode(&body).unwrap();
        assert_eq!(
            response,
            DirectoryResponse::Registered {
                id: "4321".to_string()
            }
        );
        assert_eq!(registry.lookup("4321"), Some(addr(9000)));

        drop(stream);
        for _ in 0..100 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());
    }
}
