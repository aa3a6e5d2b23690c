//! Negotiation of direction, discipline and file name before any data moves.
//!
//! ```text
//! INIT ──ack 0──▶ SENT_TYPE ──ack 1──▶ SENT_DISCIPLINE ──ack 2──▶ SENT_NAME ──▶ DONE
//! ```
//!
//! The client drives each step with send-and-wait-for-ack. The server
//! answers a replay of the step it just acknowledged with the same ack and
//! stays where it is, since a replay means its ack was lost.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::HandshakeParams;
use crate::error::TransferError;
use crate::packet::{decode_ack, encode_ack};
use crate::transport::{Inbound, Link};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn token(self) -> &'static str {
        match self {
            Direction::Upload => "UPLOAD",
            Direction::Download => "DOWNLOAD",
        }
    }

    pub fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"UPLOAD" => Some(Direction::Upload),
            b"DOWNLOAD" => Some(Direction::Download),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Retransmission discipline. Stop-and-Wait is Go-Back-N with a window of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Discipline {
    #[serde(rename = "SW")]
    StopAndWait,
    #[serde(rename = "GBN")]
    GoBackN,
}

impl Discipline {
    pub fn token(self) -> &'static str {
        match self {
            Discipline::StopAndWait => "SW",
            Discipline::GoBackN => "GBN",
        }
    }

    pub fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"SW" => Some(Discipline::StopAndWait),
            b"GBN" => Some(Discipline::GoBackN),
            _ => None,
        }
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Discipline {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Discipline::from_token(s.to_ascii_uppercase().as_bytes()).ok_or_else(|| {
            TransferError::ConfigError(format!("unknown protocol {:?}, expected SW or GBN", s))
        })
    }
}

/// What the client asks the server for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: Direction,
    pub discipline: Discipline,
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    SentType,
    SentDiscipline,
    SentName,
    Done,
}

impl HandshakeState {
    pub fn name(self) -> &'static str {
        match self {
            HandshakeState::Init => "type",
            HandshakeState::SentType => "discipline",
            HandshakeState::SentDiscipline => "name",
            HandshakeState::SentName | HandshakeState::Done => "done",
        }
    }
}

/// Client side: push the three tokens through, one acknowledged step at a time.
pub async fn initiate<L: Link>(
    link: &mut L,
    request: &TransferRequest,
    params: &HandshakeParams,
) -> Result<HandshakeState, TransferError> {
    let steps = [
        (HandshakeState::Init, Bytes::from_static(request.direction.token().as_bytes())),
        (HandshakeState::SentType, Bytes::from_static(request.discipline.token().as_bytes())),
        (HandshakeState::SentDiscipline, Bytes::from(request.file_name.clone().into_bytes())),
    ];

    let mut state = HandshakeState::Init;
    for (ordinal, (step, token)) in steps.into_iter().enumerate() {
        send_and_wait(link, token, ordinal as u32, step, params).await?;
        state = match step {
            HandshakeState::Init => HandshakeState::SentType,
            HandshakeState::SentType => HandshakeState::SentDiscipline,
            _ => HandshakeState::SentName,
        };
        debug!(step = step.name(), ack = ordinal, "handshake step acknowledged");
    }
    debug_assert_eq!(state, HandshakeState::SentName);
    Ok(HandshakeState::Done)
}

async fn send_and_wait<L: Link>(
    link: &mut L,
    token: Bytes,
    ack: u32,
    step: HandshakeState,
    params: &HandshakeParams,
) -> Result<(), TransferError> {
    link.send(token.clone()).await?;
    let mut attempts = 0;
    loop {
        match link.recv(params.ack_timeout).await? {
            Inbound::Frame(frame) => match decode_ack(&frame) {
                Ok(value) if value == ack => return Ok(()),
                Ok(value) => debug!(value, expected = ack, "ignoring stale handshake ack"),
                Err(e) => debug!("ignoring non-ack frame during handshake: {}", e),
            },
            Inbound::TimedOut => {
                attempts += 1;
                if attempts >= params.retries {
                    return Err(TransferError::HandshakeFailed { step: step.name(), attempts });
                }
                debug!(step = step.name(), attempts, "handshake ack timed out, resending");
                link.send(token.clone()).await?;
            }
        }
    }
}

/// How the server answers one handshake frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The step advanced; send this ack.
    Ack(u32),
    /// The client replayed the step we already acknowledged; send this ack again.
    Reack(u32),
    /// Unrecognized frame; send nothing.
    Ignore,
}

/// Server side of the handshake as a pure state machine.
#[derive(Debug)]
pub struct ServerHandshake {
    state: HandshakeState,
    direction: Option<Direction>,
    discipline: Option<Discipline>,
    file_name: Option<String>,
    last_token: Option<Bytes>,
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Init,
            direction: None,
            discipline: None,
            file_name: None,
            last_token: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The token acknowledged last; a later copy of it is a replay.
    pub fn last_token(&self) -> Option<&Bytes> {
        self.last_token.as_ref()
    }

    pub fn on_frame(&mut self, frame: &Bytes) -> Result<Reply, TransferError> {
        if let Some(reack) = self.replayed(frame) {
            return Ok(Reply::Reack(reack));
        }

        match self.state {
            HandshakeState::Init => {
                let direction = Direction::from_token(frame).ok_or_else(|| {
                    TransferError::ProtocolError(format!(
                        "expected a direction token, got {} bytes",
                        frame.len()
                    ))
                })?;
                self.direction = Some(direction);
                Ok(self.advance(HandshakeState::SentType, frame, 0))
            }
            HandshakeState::SentType => match Discipline::from_token(frame) {
                Some(discipline) => {
                    self.discipline = Some(discipline);
                    Ok(self.advance(HandshakeState::SentDiscipline, frame, 1))
                }
                None => Ok(Reply::Ignore),
            },
            HandshakeState::SentDiscipline => {
                let name = std::str::from_utf8(frame)
                    .ok()
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| {
                        TransferError::ProtocolError("file name is empty or not UTF-8".to_string())
                    })?;
                self.file_name = Some(name.to_string());
                Ok(self.advance(HandshakeState::SentName, frame, 2))
            }
            HandshakeState::SentName | HandshakeState::Done => Ok(Reply::Ignore),
        }
    }

    /// Close the handshake and hand out what was negotiated.
    pub fn finish(&mut self) -> Option<TransferRequest> {
        if self.state != HandshakeState::SentName {
            return None;
        }
        let request = self.request()?;
        self.state = HandshakeState::Done;
        Some(request)
    }

    /// The negotiated request once the name has been read, without closing
    /// the handshake.
    pub fn request(&self) -> Option<TransferRequest> {
        if self.state != HandshakeState::SentName {
            return None;
        }
        Some(TransferRequest {
            direction: self.direction?,
            discipline: self.discipline?,
            file_name: self.file_name.clone()?,
        })
    }

    fn replayed(&self, frame: &Bytes) -> Option<u32> {
        let ack = match self.state {
            HandshakeState::SentType => 0,
            HandshakeState::SentDiscipline => 1,
            HandshakeState::SentName | HandshakeState::Done => 2,
            HandshakeState::Init => return None,
        };
        (self.last_token.as_ref() == Some(frame)).then_some(ack)
    }

    fn advance(&mut self, next: HandshakeState, frame: &Bytes, ack: u32) -> Reply {
        self.state = next;
        self.last_token = Some(frame.clone());
        Reply::Ack(ack)
    }
}

/// Run the server side until the name is acknowledged. Each step must
/// arrive within `step_timeout` of the previous ack; frames the state
/// machine ignores do not restart that clock. `vet` sees the request before
/// the name is acked, so a refused name is never acknowledged.
/// Returns the request and the name token so replays of it can keep being
/// answered.
pub async fn accept<L, F>(
    link: &mut L,
    step_timeout: Duration,
    mut vet: F,
) -> Result<(TransferRequest, Bytes), TransferError>
where
    L: Link,
    F: FnMut(&TransferRequest) -> Result<(), TransferError>,
{
    let mut machine = ServerHandshake::new();
    let mut step_deadline = Instant::now() + step_timeout;
    while machine.state() != HandshakeState::SentName {
        let left = step_deadline.saturating_duration_since(Instant::now());
        let frame = match link.recv(left).await? {
            Inbound::Frame(frame) => frame,
            Inbound::TimedOut => {
                return Err(TransferError::HandshakeFailed {
                    step: machine.state().name(),
                    attempts: 1,
                })
            }
        };
        match machine.on_frame(&frame)? {
            Reply::Ack(ack) => {
                if let Some(request) = machine.request() {
                    vet(&request)?;
                }
                link.send(encode_ack(ack)).await?;
                step_deadline = Instant::now() + step_timeout;
            }
            Reply::Reack(ack) => {
                debug!(ack, "client replayed a handshake step, re-acknowledging");
                link.send(encode_ack(ack)).await?;
            }
            Reply::Ignore => warn!(len = frame.len(), state = ?machine.state(), "ignoring unexpected handshake frame"),
        }
    }

    let token = machine.last_token().cloned().unwrap_or_default();
    let request = machine.finish().ok_or_else(|| {
        TransferError::ProtocolError("handshake ended without a complete request".to_string())
    })?;
    Ok((request, token))
}
