//! Sliding-window bookkeeping for both ARQ roles.
//!
//! Acks are cumulative next-expected ids: ack `v` means every id below `v`
//! arrived. No I/O happens here; the drivers in [`crate::arq`] own the link.
//!
//! ```text
//!  last_ack            next_id
//!     │                   │
//! ────┼───────────────────┼──────────────▶ sequence ids
//!     │ <── in flight ──▶ │ <── unsent ──▶
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::time::Instant;

use crate::config::ExhaustionPolicy;
use crate::error::TransferError;
use crate::packet::{encode_ack, Packet};

/// One in-flight frame.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    pub frame: Bytes,
    pub last_sent: Instant,
    pub retries: u32,
}

/// What a timeout pass decided.
#[derive(Debug, Default)]
pub struct Expiry {
    /// Frames to put back on the wire, oldest first.
    pub resend: Vec<Bytes>,
    /// Ids dropped from the window after exceeding their retry budget.
    pub evicted: Vec<u32>,
}

#[derive(Debug)]
pub struct SendWindow {
    entries: BTreeMap<u32, WindowEntry>,
    capacity: usize,
    next_id: u32,
    last_ack: u32,
    final_queued: bool,
}

impl SendWindow {
    /// A zero `capacity` is treated as one.
    pub fn new(first_id: u32, capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
            next_id: first_id,
            last_ack: first_id,
            final_queued: false,
        }
    }

    pub fn has_room(&self) -> bool {
        self.entries.len() < self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn last_ack(&self) -> u32 {
        self.last_ack
    }

    /// True once the end marker has been queued; no more ids will be handed out.
    pub fn final_queued(&self) -> bool {
        self.final_queued
    }

    /// Done when the end marker went out and nothing is left in flight.
    pub fn is_complete(&self) -> bool {
        self.final_queued && self.entries.is_empty()
    }

    /// Frame `payload` under the next id (or the end marker when `payload`
    /// is `None`) and record it as in flight. Returns the frame to transmit.
    pub fn push(&mut self, payload: Option<Bytes>, now: Instant) -> Result<(u32, Bytes), TransferError> {
        if !self.has_room() {
            return Err(TransferError::ProtocolError(format!(
                "window full ({} of {})",
                self.entries.len(),
                self.capacity
            )));
        }
        if self.final_queued {
            return Err(TransferError::ProtocolError(
                "end marker already queued".to_string(),
            ));
        }

        let id = self.next_id;
        let next_id = id.checked_add(1).ok_or_else(|| {
            TransferError::ProtocolError("sequence id space exhausted".to_string())
        })?;
        let packet = match payload {
            Some(chunk) => Packet::data(id, chunk),
            None => {
                self.final_queued = true;
                Packet::end_marker(id)
            }
        };
        let frame = packet.encode()?;
        self.entries.insert(id, WindowEntry { frame: frame.clone(), last_sent: now, retries: 0 });
        self.next_id = next_id;
        Ok((id, frame))
    }

    /// Apply cumulative ack `value`. Only values above the last accepted ack
    /// and not beyond the next unassigned id count; returns how many entries
    /// left the window.
    pub fn on_ack(&mut self, value: u32) -> Option<usize> {
        if value <= self.last_ack || value > self.next_id {
            return None;
        }
        self.last_ack = value;
        let keep = self.entries.split_off(&value);
        let acked = self.entries.len();
        self.entries = keep;
        Some(acked)
    }

    /// Timeout pass: every entry is either scheduled for resend (go-back-N)
    /// or, once past `max_retries`, evicted or reported per `policy`.
    pub fn expire(
        &mut self,
        max_retries: u32,
        policy: ExhaustionPolicy,
        now: Instant,
    ) -> Result<Expiry, TransferError> {
        let mut expiry = Expiry::default();
        for (&id, entry) in self.entries.iter_mut() {
            if entry.retries >= max_retries {
                if policy == ExhaustionPolicy::Fail {
                    return Err(TransferError::RetransmitBudgetExhausted { sequence_id: id });
                }
                expiry.evicted.push(id);
            } else {
                entry.retries += 1;
                entry.last_sent = now;
                expiry.resend.push(entry.frame.clone());
            }
        }
        for id in &expiry.evicted {
            self.entries.remove(id);
        }
        Ok(expiry)
    }

    pub fn oldest_sent(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.last_sent).min()
    }
}

/// What the receiver does with one data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// In order: write the payload, then send the ack.
    Accept { payload: Bytes, ack: Bytes },
    /// In-order end marker: send the ack and close the stream.
    Finish { ack: Bytes },
    /// Out of order or duplicate: drop the payload, repeat the standing ack.
    Discard { ack: Bytes },
}

#[derive(Debug)]
pub struct ReceiveWindow {
    expected_id: u32,
    finished: bool,
}

impl ReceiveWindow {
    pub fn new(first_id: u32) -> Self {
        Self { expected_id: first_id, finished: false }
    }

    pub fn expected_id(&self) -> u32 {
        self.expected_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The standing cumulative ack: everything below `expected_id` arrived,
    /// i.e. it acknowledges `expected_id - 1`, the last packet accepted.
    pub fn standing_ack(&self) -> Bytes {
        encode_ack(self.expected_id)
    }

    pub fn on_packet(&mut self, packet: Packet) -> Delivery {
        if self.finished || packet.sequence_id != self.expected_id {
            return Delivery::Discard { ack: self.standing_ack() };
        }

        self.expected_id = self.expected_id.wrapping_add(1);
        if packet.is_final {
            self.finished = true;
            Delivery::Finish { ack: self.standing_ack() }
        } else {
            Delivery::Accept { payload: packet.payload, ack: self.standing_ack() }
        }
    }
}
