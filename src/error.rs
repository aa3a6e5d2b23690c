use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::packet::FrameError;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    #[error("Datagram from unexpected peer {actual} (expected {expected})")]
    UnexpectedPeer { expected: SocketAddr, actual: SocketAddr },

    #[error("Handshake failed at step {step} after {attempts} attempts")]
    HandshakeFailed { step: &'static str, attempts: u32 },

    #[error("Retransmit budget exhausted for packet {sequence_id}")]
    RetransmitBudgetExhausted { sequence_id: u32 },

    #[error("Transfer timed out after {elapsed:?}")]
    TransferTimedOut { elapsed: Duration },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Transfer protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let transfer_error: TransferError = io_error.into();

        match transfer_error {
            TransferError::Io(_) => {},
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_toml_deserialization_error_conversion() {
        let toml_error = toml::from_str::<crate::config::Config>("server = 3").unwrap_err();
        let transfer_error: TransferError = toml_error.into();

        match transfer_error {
            TransferError::TomlDeserialization(_) => {},
            _ => panic!("Expected TomlDeserialization error variant"),
        }
    }

    #[test]
    fn test_frame_error_conversion() {
        let transfer_error: TransferError = FrameError::TooShort { len: 2 }.into();
        assert!(matches!(transfer_error, TransferError::MalformedFrame(_)));
    }

    #[test]
    fn test_unexpected_peer_names_both_addresses() {
        let error = TransferError::UnexpectedPeer {
            expected: "127.0.0.1:5005".parse().unwrap(),
            actual: "127.0.0.1:6000".parse().unwrap(),
        };
        assert!(error.to_string().contains("127.0.0.1:6000"));
    }

    #[test]
    fn test_handshake_failed_error() {
        let error = TransferError::HandshakeFailed { step: "discipline", attempts: 70 };
        let error_string = error.to_string();
        assert!(error_string.contains("discipline"));
        assert!(error_string.contains("70"));
    }

    #[test]
    fn test_retransmit_budget_error() {
        let error = TransferError::RetransmitBudgetExhausted { sequence_id: 17 };
        assert!(error.to_string().contains("17"));
    }

    #[test]
    fn test_transfer_timed_out_error() {
        let error = TransferError::TransferTimedOut { elapsed: Duration::from_secs(300) };
        assert!(error.to_string().contains("300s"));
    }

    #[test]
    fn test_file_not_found_error() {
        let path = PathBuf::from("/nonexistent/file.txt");
        let error = TransferError::FileNotFound(path.clone());
        let error_string = error.to_string();
        assert!(error_string.contains(path.to_string_lossy().as_ref()));
    }

    #[test]
    fn test_protocol_error() {
        let error = TransferError::ProtocolError("Invalid direction token".to_string());
        let error_string = error.to_string();
        assert!(error_string.contains("Invalid direction token"));
    }

    #[test]
    fn test_config_error() {
        let error = TransferError::ConfigError("window_size_gbn must be at least 1".to_string());
        assert!(error.to_string().contains("window_size_gbn"));
    }

    #[test]
    fn test_error_debug_format() {
        let error = TransferError::ChannelClosed("outbound queue");
        let debug_string = format!("{:?}", error);
        assert!(debug_string.contains("ChannelClosed"));
        assert!(debug_string.contains("outbound queue"));
    }
}
