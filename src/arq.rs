//! The windowed ARQ engine. Both roles run over any [`Link`]; Stop-and-Wait
//! is the same code with a window of one.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ArqParams;
use crate::error::TransferError;
use crate::packet::{decode, decode_ack, DATA_SEQUENCE_BASE};
use crate::stream::{FileStreamReader, FileStreamWriter};
use crate::transport::{Inbound, Link};
use crate::window::{Delivery, ReceiveWindow, SendWindow};

/// Counters gathered by one run of either role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArqReport {
    /// Payload bytes read (sender) or written (receiver).
    pub bytes: u64,
    /// Data packets sent once or accepted, excluding the end marker.
    pub data_packets: u64,
    pub retransmissions: u64,
    pub evicted: u64,
    /// Out-of-order or duplicate packets dropped by the receiver.
    pub discarded: u64,
    pub peak_in_flight: usize,
}

/// Sender role: stream `reader` to the peer and return once the end marker
/// has left the window.
pub async fn send_stream<L, R>(
    link: &mut L,
    reader: &mut FileStreamReader<R>,
    params: &ArqParams,
) -> Result<ArqReport, TransferError>
where
    L: Link,
    R: AsyncRead + Unpin,
{
    let started = Instant::now();
    let deadline = started + params.max_transfer_duration;
    let mut window = SendWindow::new(DATA_SEQUENCE_BASE, params.window_size);
    let mut report = ArqReport::default();

    loop {
        while window.has_room() && !window.final_queued() {
            let chunk = reader.next_chunk().await?;
            let len = chunk.as_ref().map(|c| c.len());
            let (id, frame) = window.push(chunk, Instant::now())?;
            link.send(frame).await?;
            match len {
                Some(len) => {
                    report.bytes += len as u64;
                    report.data_packets += 1;
                    trace!(id, len, "sent data packet");
                }
                None => debug!(id, "sent end marker"),
            }
            report.peak_in_flight = report.peak_in_flight.max(window.in_flight());
        }

        if window.is_complete() {
            break;
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(TransferError::TransferTimedOut { elapsed: now - started });
        }
        let timer = window.oldest_sent().unwrap_or(now) + params.ack_timeout;
        let wait = timer.min(deadline).saturating_duration_since(now);

        match link.recv(wait).await? {
            Inbound::Frame(frame) => match decode_ack(&frame) {
                Ok(value) => match window.on_ack(value) {
                    Some(acked) => trace!(value, acked, in_flight = window.in_flight(), "window advanced"),
                    None => trace!(value, last_ack = window.last_ack(), "ignoring stale ack"),
                },
                Err(e) => debug!("ignoring non-ack frame: {}", e),
            },
            Inbound::TimedOut => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TransferError::TransferTimedOut { elapsed: now - started });
                }
                let expiry = window.expire(params.max_retries, params.exhaustion_policy, now)?;
                for id in &expiry.evicted {
                    warn!(id, retries = params.max_retries, "retry budget exhausted, assuming delivered");
                }
                report.evicted += expiry.evicted.len() as u64;
                if !expiry.resend.is_empty() {
                    debug!(count = expiry.resend.len(), from = window.last_ack(), "ack timeout, resending window");
                }
                for frame in expiry.resend {
                    link.send(frame).await?;
                    report.retransmissions += 1;
                }
            }
        }
    }

    Ok(report)
}

/// Receiver role: write in-order payloads into `writer` until the end marker
/// arrives, then linger to re-acknowledge a retransmitted end marker.
pub async fn receive_stream<L, W>(
    link: &mut L,
    writer: &mut FileStreamWriter<W>,
    params: &ArqParams,
) -> Result<ArqReport, TransferError>
where
    L: Link,
    W: AsyncWrite + Unpin,
{
    let started = Instant::now();
    let deadline = started + params.max_transfer_duration;
    let mut window = ReceiveWindow::new(DATA_SEQUENCE_BASE);
    let mut report = ArqReport::default();

    while !window.is_finished() {
        let now = Instant::now();
        let wait = params.idle_timeout.min(deadline.saturating_duration_since(now));
        let frame = match link.recv(wait).await? {
            Inbound::Frame(frame) => frame,
            Inbound::TimedOut => {
                warn!(expected = window.expected_id(), "sender went quiet");
                return Err(TransferError::TransferTimedOut { elapsed: started.elapsed() });
            }
        };
        let packet = match decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(len = frame.len(), "dropping malformed frame: {}", e);
                continue;
            }
        };

        let id = packet.sequence_id;
        match window.on_packet(packet) {
            Delivery::Accept { payload, ack } => {
                writer.append(&payload).await?;
                report.bytes += payload.len() as u64;
                report.data_packets += 1;
                trace!(id, len = payload.len(), "accepted data packet");
                link.send(ack).await?;
            }
            Delivery::Finish { ack } => {
                writer.close().await?;
                debug!(id, "accepted end marker");
                link.send(ack).await?;
            }
            Delivery::Discard { ack } => {
                report.discarded += 1;
                trace!(id, expected = window.expected_id(), "discarding out-of-order packet");
                link.send(ack).await?;
            }
        }
    }

    let until = Instant::now() + params.linger;
    linger(link, &mut window, until.min(deadline)).await?;
    Ok(report)
}

/// Answer retransmitted end markers until `until`. Traffic never extends the
/// window, so a peer that keeps talking cannot hold the session open.
async fn linger<L: Link>(
    link: &mut L,
    window: &mut ReceiveWindow,
    until: Instant,
) -> Result<(), TransferError> {
    loop {
        let left = until.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(());
        }
        let frame = match link.recv(left).await? {
            Inbound::Frame(frame) => frame,
            Inbound::TimedOut => return Ok(()),
        };
        match decode(&frame) {
            Ok(packet) => {
                if let Delivery::Discard { ack } = window.on_packet(packet) {
                    debug!("re-acknowledging end of stream");
                    link.send(ack).await?;
                }
            }
            Err(e) => trace!(len = frame.len(), "ignoring frame while lingering: {}", e),
        }
    }
}
