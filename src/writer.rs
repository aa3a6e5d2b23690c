//! The server's single point of transmission.
//!
//! Every session hands its frames to one [`SerializedWriter`] task, which
//! owns the write side of the shared socket. Frames leave in the order they
//! were queued.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub frame: Bytes,
    pub addr: SocketAddr,
}

pub struct SerializedWriter {
    socket: Arc<UdpSocket>,
    queue: mpsc::Receiver<Outbound>,
    sent: u64,
}

impl SerializedWriter {
    /// Build the writer and the sender half sessions use to reach it.
    pub fn channel(socket: Arc<UdpSocket>, capacity: usize) -> (mpsc::Sender<Outbound>, Self) {
        let (tx, queue) = mpsc::channel(capacity.max(1));
        (tx, Self { socket, queue, sent: 0 })
    }

    /// Drain the queue until every sender is gone. Returns how many frames
    /// went out.
    pub async fn run(mut self) -> u64 {
        while let Some(Outbound { frame, addr }) = self.queue.recv().await {
            match self.socket.send_to(&frame, addr).await {
                Ok(_) => self.sent += 1,
                // one unreachable peer must not stop the others
                Err(e) => warn!(%addr, "send failed: {}", e),
            }
        }
        debug!(sent = self.sent, "outbound queue closed, writer exiting");
        self.sent
    }
}
