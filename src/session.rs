//! One peer's handshake-plus-transfer lifecycle on the server.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::arq;
use crate::error::TransferError;
use crate::handshake::{self, Direction, TransferRequest};
use crate::packet::encode_ack;
use crate::server::ServerSettings;
use crate::stream::{FileStreamReader, FileStreamWriter};
use crate::transfer::TransferReport;
use crate::transport::{Inbound, Link};
use crate::writer::Outbound;

/// A session's view of the shared socket: datagrams routed to it by the
/// dispatcher come in, frames for the serialized writer go out.
pub struct SessionLink {
    peer: SocketAddr,
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Outbound>,
    replay: Option<(Bytes, Bytes)>,
}

impl SessionLink {
    pub fn new(peer: SocketAddr, inbound: mpsc::Receiver<Bytes>, outbound: mpsc::Sender<Outbound>) -> Self {
        Self { peer, inbound, outbound, replay: None }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// From now on, answer every copy of `token` with `ack` instead of
    /// passing it up. Covers a client that never saw the last handshake ack.
    pub fn guard_replays(&mut self, token: Bytes, ack: Bytes) {
        self.replay = Some((token, ack));
    }

    async fn push(&self, frame: Bytes) -> Result<(), TransferError> {
        self.outbound
            .send(Outbound { frame, addr: self.peer })
            .await
            .map_err(|_| TransferError::ChannelClosed("outbound queue"))
    }
}

#[async_trait]
impl Link for SessionLink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError> {
        self.push(frame).await
    }

    async fn recv(&mut self, wait: Duration) -> Result<Inbound, TransferError> {
        let deadline = Instant::now() + wait;
        loop {
            let frame = match timeout_at(deadline, self.inbound.recv()).await {
                Err(_) => return Ok(Inbound::TimedOut),
                Ok(None) => return Err(TransferError::ChannelClosed("session inbound queue")),
                Ok(Some(frame)) => frame,
            };
            match &self.replay {
                Some((token, ack)) if *token == frame => {
                    debug!("client replayed its last handshake step, re-acknowledging");
                    let ack = ack.clone();
                    self.push(ack).await?;
                }
                _ => return Ok(Inbound::Frame(frame)),
            }
        }
    }
}

/// Map a requested name onto a file directly inside `root`.
pub fn resolve_storage_path(root: &Path, name: &str) -> Result<PathBuf, TransferError> {
    let unsafe_name = name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if unsafe_name {
        return Err(TransferError::ProtocolError(format!(
            "refusing file name {:?}",
            name
        )));
    }
    Ok(root.join(name))
}

/// Decide whether a request may be acknowledged: the name must be safe,
/// and a download must name a file that is there to serve.
fn vet_request(root: &Path, request: &TransferRequest) -> Result<PathBuf, TransferError> {
    let path = resolve_storage_path(root, &request.file_name)?;
    if request.direction == Direction::Download && !path.is_file() {
        return Err(TransferError::FileNotFound(path));
    }
    Ok(path)
}

/// Drive one session to completion: handshake, then move the file.
#[instrument(name = "session", skip_all, fields(id = %Uuid::new_v4(), peer = %link.peer()))]
pub async fn run_session(
    mut link: SessionLink,
    settings: &ServerSettings,
) -> Result<TransferReport, TransferError> {
    let started = Instant::now();
    let protocol = &settings.protocol;
    let step_timeout = Duration::from_millis(protocol.handshake_step_timeout_ms);

    let mut path = PathBuf::new();
    let (request, name_token) = handshake::accept(&mut link, step_timeout, |request| {
        path = vet_request(&settings.storage, request)?;
        Ok(())
    })
    .await?;
    link.guard_replays(name_token, encode_ack(2));
    info!(
        direction = %request.direction,
        discipline = %request.discipline,
        "Negotiated transfer of {}",
        request.file_name
    );

    let params = protocol.arq_params(request.discipline);

    let (arq, sha256) = match request.direction {
        Direction::Upload => {
            let mut writer = FileStreamWriter::create(&path).await?;
            let arq = arq::receive_stream(&mut link, &mut writer, &params).await?;
            (arq, writer.digest())
        }
        Direction::Download => {
            let mut reader = FileStreamReader::open(&path, params.chunk_size).await?;
            let arq = arq::send_stream(&mut link, &mut reader, &params).await?;
            (arq, reader.digest())
        }
    };

    let report = TransferReport::new(&request, &arq, started.elapsed(), sha256);
    info!("{}", report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::handshake::Discipline;
    use crate::transfer::{download_with, upload_with};
    use tempfile::tempdir;

    /// The client end of a session's channels.
    struct ChannelPeer {
        to_session: mpsc::Sender<Bytes>,
        from_session: mpsc::Receiver<Outbound>,
    }

    #[async_trait]
    impl Link for ChannelPeer {
        async fn send(&mut self, frame: Bytes) -> Result<(), TransferError> {
            let _ = self.to_session.send(frame).await;
            Ok(())
        }

        async fn recv(&mut self, wait: Duration) -> Result<Inbound, TransferError> {
            match tokio::time::timeout(wait, self.from_session.recv()).await {
                Ok(Some(out)) => Ok(Inbound::Frame(out.frame)),
                Ok(None) => {
                    tokio::time::sleep(wait).await;
                    Ok(Inbound::TimedOut)
                }
                Err(_) => Ok(Inbound::TimedOut),
            }
        }
    }

    fn session_pair() -> (SessionLink, ChannelPeer) {
        let (to_session, inbound) = mpsc::channel(64);
        let (outbound, from_session) = mpsc::channel(64);
        let peer = "127.0.0.1:4000".parse().unwrap();
        (
            SessionLink::new(peer, inbound, outbound),
            ChannelPeer { to_session, from_session },
        )
    }

    fn settings(storage: &Path) -> ServerSettings {
        let mut protocol = ProtocolConfig::default();
        protocol.chunk_size = 64;
        ServerSettings { storage: storage.to_path_buf(), protocol, ..ServerSettings::default() }
    }

    #[test]
    fn test_resolve_storage_path() {
        let root = Path::new("/srv/files");
        assert_eq!(resolve_storage_path(root, "a.txt").unwrap(), root.join("a.txt"));
        for bad in ["", ".", "..", "../etc/passwd", "a/b", "a\\b", "x..y"] {
            assert!(
                matches!(resolve_storage_path(root, bad), Err(TransferError::ProtocolError(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_guard_answers_and_swallows_token() {
        let (mut link, mut peer) = session_pair();
        link.guard_replays(Bytes::from_static(b"name.txt"), encode_ack(2));

        peer.send(Bytes::from_static(b"name.txt")).await.unwrap();
        peer.send(Bytes::from_static(b"data")).await.unwrap();

        assert_eq!(
            link.recv(Duration::from_secs(1)).await.unwrap(),
            Inbound::Frame(Bytes::from_static(b"data"))
        );
        assert_eq!(
            peer.recv(Duration::from_secs(1)).await.unwrap(),
            Inbound::Frame(encode_ack(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_stores_upload() {
        let temp_dir = tempdir().unwrap();
        let source = temp_dir.path().join("source.bin");
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        tokio::fs::write(&source, &data).await.unwrap();

        let storage = temp_dir.path().join("storage");
        let server_settings = settings(&storage);
        let (link, mut peer) = session_pair();
        let worker = tokio::spawn(async move { run_session(link, &server_settings).await });

        let protocol = settings(&storage).protocol;
        let sent = upload_with(&mut peer, "stored.bin", &source, Discipline::GoBackN, &protocol)
            .await
            .unwrap();
        let stored = worker.await.unwrap().unwrap();

        assert_eq!(tokio::fs::read(storage.join("stored.bin")).await.unwrap(), data);
        assert_eq!(sent.sha256, stored.sha256);
        assert_eq!(stored.direction, Direction::Upload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_serves_download() {
        let temp_dir = tempdir().unwrap();
        let storage = temp_dir.path().join("storage");
        tokio::fs::create_dir_all(&storage).await.unwrap();
        tokio::fs::write(storage.join("hosted.txt"), b"served from storage").await.unwrap();

        let server_settings = settings(&storage);
        let (link, mut peer) = session_pair();
        let worker = tokio::spawn(async move { run_session(link, &server_settings).await });

        let dest = temp_dir.path().join("out").join("hosted.txt");
        let protocol = settings(&storage).protocol;
        download_with(&mut peer, "hosted.txt", &dest, Discipline::StopAndWait, &protocol)
            .await
            .unwrap();
        worker.await.unwrap().unwrap();

        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"served from storage");
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_reports_missing_download() {
        let temp_dir = tempdir().unwrap();
        let server_settings = settings(temp_dir.path());
        let (link, mut peer) = session_pair();
        let worker = tokio::spawn(async move { run_session(link, &server_settings).await });

        let request = handshake::TransferRequest {
            direction: Direction::Download,
            discipline: Discipline::StopAndWait,
            file_name: "absent.bin".to_string(),
        };
        let mut params = ProtocolConfig::default().handshake_params(Discipline::StopAndWait);
        params.retries = 5;
        // the name is refused before its ack, so the client never gets past it
        let err = handshake::initiate(&mut peer, &request, &params).await.unwrap_err();

        assert!(matches!(err, TransferError::HandshakeFailed { step: "name", .. }));
        assert!(matches!(worker.await.unwrap(), Err(TransferError::FileNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_refuses_unsafe_name_before_ack() {
        let temp_dir = tempdir().unwrap();
        let storage = temp_dir.path().join("storage");
        let server_settings = settings(&storage);
        let (link, mut peer) = session_pair();
        let worker = tokio::spawn(async move { run_session(link, &server_settings).await });

        let request = handshake::TransferRequest {
            direction: Direction::Upload,
            discipline: Discipline::GoBackN,
            file_name: "../escape.bin".to_string(),
        };
        let mut params = ProtocolConfig::default().handshake_params(Discipline::GoBackN);
        params.retries = 5;
        let err = handshake::initiate(&mut peer, &request, &params).await.unwrap_err();

        assert!(matches!(err, TransferError::HandshakeFailed { step: "name", .. }));
        assert!(matches!(worker.await.unwrap(), Err(TransferError::ProtocolError(_))));
        assert!(!temp_dir.path().join("escape.bin").exists());
    }
}
