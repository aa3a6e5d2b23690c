//! Client entry points.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::arq::{self, ArqReport};
use crate::config::ProtocolConfig;
use crate::error::TransferError;
use crate::handshake::{self, Direction, Discipline, TransferRequest};
use crate::stream::{FileStreamReader, FileStreamWriter};
use crate::transport::{Link, PeerLink};

/// Outcome of one completed transfer, from either side.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub file_name: String,
    pub direction: Direction,
    pub discipline: Discipline,
    pub bytes: u64,
    pub data_packets: u64,
    pub retransmissions: u64,
    pub evicted: u64,
    pub peak_in_flight: usize,
    pub elapsed: Duration,
    /// Hex SHA-256 of the bytes streamed.
    pub sha256: String,
}

impl TransferReport {
    pub(crate) fn new(
        request: &TransferRequest,
        arq: &ArqReport,
        elapsed: Duration,
        sha256: String,
    ) -> Self {
        Self {
            file_name: request.file_name.clone(),
            direction: request.direction,
            discipline: request.discipline,
            bytes: arq.bytes,
            data_packets: arq.data_packets,
            retransmissions: arq.retransmissions,
            evicted: arq.evicted,
            peak_in_flight: arq.peak_in_flight,
            elapsed,
            sha256,
        }
    }

    pub fn throughput_mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / (secs * 1_000_000.0)
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} via {}: {} bytes in {} packets, {} retransmitted, {} evicted, {:.2?} ({:.2} Mbps), sha256 {}",
            self.direction,
            self.file_name,
            self.discipline,
            self.bytes,
            self.data_packets,
            self.retransmissions,
            self.evicted,
            self.elapsed,
            self.throughput_mbps(),
            self.sha256
        )
    }
}

/// Upload `local_path` to the server at `server_addr`, stored as `file_name`.
#[instrument(skip_all, fields(session = %Uuid::new_v4(), server = %server_addr, file = file_name, discipline = %discipline))]
pub async fn run_upload(
    socket: UdpSocket,
    server_addr: SocketAddr,
    file_name: &str,
    local_path: &Path,
    discipline: Discipline,
    protocol: &ProtocolConfig,
) -> Result<TransferReport, TransferError> {
    let mut link = PeerLink::new(Arc::new(socket), server_addr);
    upload_with(&mut link, file_name, local_path, discipline, protocol).await
}

/// Download `file_name` from the server at `server_addr` into `local_path`.
#[instrument(skip_all, fields(session = %Uuid::new_v4(), server = %server_addr, file = file_name, discipline = %discipline))]
pub async fn run_download(
    socket: UdpSocket,
    server_addr: SocketAddr,
    file_name: &str,
    local_path: &Path,
    discipline: Discipline,
    protocol: &ProtocolConfig,
) -> Result<TransferReport, TransferError> {
    let mut link = PeerLink::new(Arc::new(socket), server_addr);
    download_with(&mut link, file_name, local_path, discipline, protocol).await
}

/// Upload over an arbitrary link. The source is opened before the handshake
/// so a missing file never reaches the server.
pub async fn upload_with<L: Link>(
    link: &mut L,
    file_name: &str,
    local_path: &Path,
    discipline: Discipline,
    protocol: &ProtocolConfig,
) -> Result<TransferReport, TransferError> {
    let request = request(Direction::Upload, discipline, file_name)?;
    let params = protocol.arq_params(discipline);
    let mut reader = FileStreamReader::open(local_path, params.chunk_size).await?;

    let started = Instant::now();
    handshake::initiate(link, &request, &protocol.handshake_params(discipline)).await?;
    info!("Handshake complete, uploading {}", local_path.display());

    let arq = arq::send_stream(link, &mut reader, &params).await?;
    let report = TransferReport::new(&request, &arq, started.elapsed(), reader.digest());
    info!("{}", report);
    Ok(report)
}

/// Download over an arbitrary link. The destination is only created once the
/// server has accepted the request.
pub async fn download_with<L: Link>(
    link: &mut L,
    file_name: &str,
    local_path: &Path,
    discipline: Discipline,
    protocol: &ProtocolConfig,
) -> Result<TransferReport, TransferError> {
    let request = request(Direction::Download, discipline, file_name)?;
    let params = protocol.arq_params(discipline);

    let started = Instant::now();
    handshake::initiate(link, &request, &protocol.handshake_params(discipline)).await?;
    info!("Handshake complete, downloading into {}", local_path.display());

    let mut writer = FileStreamWriter::create(local_path).await?;
    let arq = arq::receive_stream(link, &mut writer, &params).await?;
    let report = TransferReport::new(&request, &arq, started.elapsed(), writer.digest());
    info!("{}", report);
    Ok(report)
}

fn request(
    direction: Direction,
    discipline: Discipline,
    file_name: &str,
) -> Result<TransferRequest, TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::ConfigError("file name must not be empty".to_string()));
    }
    // the server would read it as a replay of the discipline step
    if file_name == discipline.token() {
        return Err(TransferError::ConfigError(format!(
            "file name {:?} collides with the {} discipline token",
            file_name, discipline
        )));
    }
    Ok(TransferRequest { direction, discipline, file_name: file_name.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::memory_pair;
    use crate::transport::Inbound;
    use tempfile::tempdir;

    fn report(bytes: u64, elapsed: Duration) -> TransferReport {
        TransferReport {
            file_name: "a.bin".to_string(),
            direction: Direction::Upload,
            discipline: Discipline::GoBackN,
            bytes,
            data_packets: 1,
            retransmissions: 0,
            evicted: 0,
            peak_in_flight: 1,
            elapsed,
            sha256: String::new(),
        }
    }

    #[test]
    fn test_throughput() {
        assert_eq!(report(1_000_000, Duration::from_secs(1)).throughput_mbps(), 8.0);
        assert_eq!(report(10, Duration::ZERO).throughput_mbps(), 0.0);
    }

    #[test]
    fn test_report_display_names_the_transfer() {
        let text = report(5, Duration::from_millis(10)).to_string();
        assert!(text.starts_with("UPLOAD a.bin via GBN: 5 bytes"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_of_missing_file_never_contacts_server() {
        let temp_dir = tempdir().unwrap();
        let (mut client, mut server) = memory_pair();

        let err = upload_with(
            &mut client,
            "gone.bin",
            &temp_dir.path().join("gone.bin"),
            Discipline::StopAndWait,
            &ProtocolConfig::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::FileNotFound(_)));
        assert_eq!(server.recv(Duration::from_secs(1)).await.unwrap(), Inbound::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_name_is_rejected() {
        let (mut client, _server) = memory_pair();
        let err = download_with(
            &mut client,
            "",
            Path::new("unused"),
            Discipline::GoBackN,
            &ProtocolConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::ConfigError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_name_matching_discipline_token_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let source = temp_dir.path().join("GBN");
        tokio::fs::write(&source, b"abc").await.unwrap();
        let (mut client, mut server) = memory_pair();

        let err = upload_with(&mut client, "GBN", &source, Discipline::GoBackN, &ProtocolConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ConfigError(_)));
        assert_eq!(server.recv(Duration::from_secs(1)).await.unwrap(), Inbound::TimedOut);

        // the same name under the other discipline is unambiguous
        assert!(request(Direction::Upload, Discipline::StopAndWait, "GBN").is_ok());
    }
}
