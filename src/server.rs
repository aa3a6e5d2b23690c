//! Server side: one socket, one reader, one writer, a worker per peer.
//!
//! The [`SessionDispatcher`] is owned by the reader task alone. Workers never
//! touch the session table; they report back over a channel when they end,
//! tagged with the generation they were spawned under so a late report
//! cannot evict a newer session from the same address.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::config::{
    Config, ProtocolConfig, DEFAULT_STORAGE_DIRECTORY, MAX_SESSIONS, OUTBOUND_QUEUE_CAPACITY,
    SESSION_QUEUE_CAPACITY,
};
use crate::error::TransferError;
use crate::session::{run_session, SessionLink};
use crate::transport::RECV_BUFFER_SIZE;
use crate::writer::{Outbound, SerializedWriter};

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub storage: PathBuf,
    pub protocol: ProtocolConfig,
    pub max_sessions: usize,
    pub session_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            storage: PathBuf::from(DEFAULT_STORAGE_DIRECTORY),
            protocol: ProtocolConfig::default(),
            max_sessions: MAX_SESSIONS,
            session_queue_capacity: SESSION_QUEUE_CAPACITY,
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            storage: PathBuf::from(&config.server.storage_directory),
            protocol: config.protocol.clone(),
            max_sessions: config.server.max_sessions,
            session_queue_capacity: config.server.session_queue_capacity,
            outbound_queue_capacity: config.server.outbound_queue_capacity,
        }
    }
}

/// Sent by a worker when its session reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEnded {
    pub addr: SocketAddr,
    pub generation: u64,
}

/// What happened to one inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Queued for an existing session.
    Routed,
    /// First datagram of a new session.
    Spawned { generation: u64 },
    /// The session's queue was full; the sender will retransmit.
    Dropped,
    /// New peer turned away at the session limit.
    Rejected,
}

struct SessionHandle {
    inbound: mpsc::Sender<Bytes>,
    generation: u64,
}

pub struct SessionDispatcher {
    sessions: HashMap<SocketAddr, SessionHandle>,
    settings: Arc<ServerSettings>,
    outbound: mpsc::Sender<Outbound>,
    ended: mpsc::UnboundedSender<SessionEnded>,
    next_generation: u64,
}

impl SessionDispatcher {
    pub fn new(
        settings: Arc<ServerSettings>,
        outbound: mpsc::Sender<Outbound>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEnded>) {
        let (ended, ended_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            sessions: HashMap::new(),
            settings,
            outbound,
            ended,
            next_generation: 0,
        };
        (dispatcher, ended_rx)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_active(&self, addr: &SocketAddr) -> bool {
        self.sessions.contains_key(addr)
    }

    /// Route `frame` to the session for `addr`, starting one if needed.
    /// Never blocks.
    pub fn dispatch(&mut self, frame: Bytes, addr: SocketAddr) -> Dispatch {
        let frame = match self.sessions.get(&addr) {
            Some(handle) => match handle.inbound.try_send(frame) {
                Ok(()) => return Dispatch::Routed,
                Err(TrySendError::Full(_)) => {
                    debug!(%addr, "session queue full, dropping datagram");
                    return Dispatch::Dropped;
                }
                Err(TrySendError::Closed(frame)) => {
                    // worker already gone; its end report is still in flight
                    self.sessions.remove(&addr);
                    frame
                }
            },
            None => frame,
        };

        if self.sessions.len() >= self.settings.max_sessions {
            warn!(%addr, limit = self.settings.max_sessions, "session limit reached, ignoring new peer");
            return Dispatch::Rejected;
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let (inbound_tx, inbound_rx) = mpsc::channel(self.settings.session_queue_capacity.max(1));
        // cannot fail: the queue is fresh and holds at least one frame
        let _ = inbound_tx.try_send(frame);
        self.sessions.insert(addr, SessionHandle { inbound: inbound_tx, generation });

        let link = SessionLink::new(addr, inbound_rx, self.outbound.clone());
        let settings = self.settings.clone();
        let ended = self.ended.clone();
        tokio::spawn(async move {
            if let Err(e) = run_session(link, &settings).await {
                error!(peer = %addr, "Session failed: {}", e);
            }
            let _ = ended.send(SessionEnded { addr, generation });
        });

        info!(%addr, generation, active = self.sessions.len(), "New session");
        Dispatch::Spawned { generation }
    }

    /// Forget a finished session, unless the address already belongs to a
    /// newer one.
    pub fn on_ended(&mut self, ended: SessionEnded) {
        if let Some(handle) = self.sessions.get(&ended.addr) {
            if handle.generation == ended.generation {
                self.sessions.remove(&ended.addr);
                debug!(addr = %ended.addr, active = self.sessions.len(), "Session removed");
            }
        }
    }
}

/// Serve transfers on `socket` until a socket error ends the loop.
pub async fn accept_loop(socket: UdpSocket, settings: ServerSettings) -> Result<(), TransferError> {
    tokio::fs::create_dir_all(&settings.storage).await?;
    let socket = Arc::new(socket);
    info!(
        "Server listening on {}, storing files in {}",
        socket.local_addr()?,
        settings.storage.display()
    );

    let (outbound, writer) = SerializedWriter::channel(socket.clone(), settings.outbound_queue_capacity);
    tokio::spawn(writer.run());

    let (mut dispatcher, mut ended) = SessionDispatcher::new(Arc::new(settings), outbound);
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, addr)) => {
                    dispatcher.dispatch(Bytes::copy_from_slice(&buf[..n]), addr);
                }
                // ICMP unreachable for a peer that went away
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    debug!("ignoring connection reset on listening socket");
                }
                Err(e) => {
                    error!("Failed to receive datagram: {}", e);
                    return Err(e.into());
                }
            },
            Some(done) = ended.recv() => dispatcher.on_ended(done),
        }
    }
}
