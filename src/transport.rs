//! The datagram primitive the transfer engine runs on.
//!
//! A [`Link`] is one conversation with one peer: send a frame, or wait a
//! bounded time for the next frame. Timing out is an ordinary
//! [`Inbound::TimedOut`] value, never an error.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::error::TransferError;

/// Receive buffer size. Larger than the datagram budget so overlong frames
/// arrive whole and are rejected by the codec instead of being truncated.
pub const RECV_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Bytes),
    TimedOut,
}

#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError>;

    /// Wait at most `wait` for the next frame from the peer.
    async fn recv(&mut self, wait: Duration) -> Result<Inbound, TransferError>;
}

#[async_trait]
impl<L: Link + ?Sized> Link for &mut L {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError> {
        (**self).send(frame).await
    }

    async fn recv(&mut self, wait: Duration) -> Result<Inbound, TransferError> {
        (**self).recv(wait).await
    }
}

/// Client-side link: a UDP socket talking to a single server address.
/// Datagrams from any other source are dropped.
pub struct PeerLink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    buf: Vec<u8>,
}

impl PeerLink {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer, buf: vec![0u8; RECV_BUFFER_SIZE] }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Link for PeerLink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError> {
        self.socket.send_to(&frame, self.peer).await?;
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Inbound, TransferError> {
        let deadline = Instant::now() + wait;
        loop {
            match timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await {
                Err(_) => return Ok(Inbound::TimedOut),
                // ICMP port-unreachable from an earlier send surfaces here on some platforms
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Ok(Err(e)) => return Err(TransferError::Io(e)),
                Ok(Ok((n, from))) if from != self.peer => {
                    let err = TransferError::UnexpectedPeer { expected: self.peer, actual: from };
                    debug!(bytes = n, "dropping datagram: {}", err);
                }
                Ok(Ok((n, _))) => return Ok(Inbound::Frame(Bytes::copy_from_slice(&self.buf[..n]))),
            }
        }
    }
}
