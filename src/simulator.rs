//! Fault injection for exercising the retransmission engine.
//!
//! | Fault         | Description                                          |
//! |---------------|------------------------------------------------------|
//! | Inbound loss  | Drop a received frame with probability `inbound_loss`. |
//! | Outbound loss | Drop a sent frame with probability `outbound_loss`.    |
//!
//! The RNG is seeded so a failing run can be replayed exactly.
//! [`memory_pair`] gives two connected in-process links for tests that do
//! not want a real socket.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::trace;

use crate::error::TransferError;
use crate::transport::{Inbound, Link};

/// Probabilities are in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct LossConfig {
    pub inbound_loss: f64,
    pub outbound_loss: f64,
    pub seed: u64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self { inbound_loss: 0.0, outbound_loss: 0.0, seed: 0 }
    }
}

impl LossConfig {
    pub fn drop_outbound(probability: f64, seed: u64) -> Self {
        Self { outbound_loss: probability, seed, ..Self::default() }
    }

    pub fn drop_inbound(probability: f64, seed: u64) -> Self {
        Self { inbound_loss: probability, seed, ..Self::default() }
    }
}

pub struct LossyLink<L> {
    inner: L,
    config: LossConfig,
    rng: StdRng,
    dropped: u64,
}

impl<L: Link> LossyLink<L> {
    pub fn new(inner: L, config: LossConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { inner, config, rng, dropped: 0 }
    }

    /// Frames discarded so far in either direction.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn into_inner(self) -> L {
        self.inner
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen_bool(probability.min(1.0))
    }
}

#[async_trait]
impl<L: Link> Link for LossyLink<L> {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError> {
        if self.roll(self.config.outbound_loss) {
            self.dropped += 1;
            trace!(len = frame.len(), "simulator dropped outbound frame");
            return Ok(());
        }
        self.inner.send(frame).await
    }

    async fn recv(&mut self, wait: Duration) -> Result<Inbound, TransferError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.inner.recv(remaining).await? {
                Inbound::Frame(frame) if self.roll(self.config.inbound_loss) => {
                    self.dropped += 1;
                    trace!(len = frame.len(), "simulator dropped inbound frame");
                }
                other => return Ok(other),
            }
        }
    }
}

/// One end of an in-process link created by [`memory_pair`].
pub struct MemoryLink {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

pub fn memory_pair() -> (MemoryLink, MemoryLink) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (MemoryLink { tx: a_tx, rx: a_rx }, MemoryLink { tx: b_tx, rx: b_rx })
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError> {
        // A vanished peer is just a black hole, like an unreachable UDP port.
        let _ = self.tx.send(frame);
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Inbound, TransferError> {
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(Inbound::Frame(frame)),
            Ok(None) => {
                // Peer dropped its end; nothing will ever arrive.
                tokio::time::sleep(wait).await;
                Ok(Inbound::TimedOut)
            }
            Err(_) => Ok(Inbound::TimedOut),
        }
    }
}
