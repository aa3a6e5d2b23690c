use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::TransferError;
use crate::handshake::Discipline;
use crate::packet::MAX_PAYLOAD;

// Framing constants
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

// Retransmission constants
pub const WINDOW_SIZE_SW: usize = 1;
pub const WINDOW_SIZE_GBN: usize = 4;
pub const ACK_TIMEOUT_SW_MS: u64 = 100;
pub const ACK_TIMEOUT_GBN_MS: u64 = 250;
pub const MAX_RETRIES_PER_PACKET: u32 = 70;
pub const MAX_TRANSFER_SECONDS: u64 = 300;
pub const FINAL_ACK_LINGER_FACTOR: u32 = 3;

// Handshake constants
pub const HANDSHAKE_RETRIES: u32 = 70;
pub const HANDSHAKE_STEP_TIMEOUT_MS: u64 = 2000;
pub const IDLE_TIMEOUT_SECONDS: u64 = 30;

// Server constants
pub const DEFAULT_PORT: u16 = 5005;
pub const DEFAULT_STORAGE_DIRECTORY: &str = "./storage";
pub const MAX_SESSIONS: usize = 100;
pub const SESSION_QUEUE_CAPACITY: usize = 256;
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub storage_directory: String,
    pub max_sessions: usize,
    pub session_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_address: String,
    pub server_port: u16,
    pub discipline: Discipline,
}

/// What the sender does once a packet has been retransmitted
/// `max_retries_per_packet` times without being acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExhaustionPolicy {
    /// Evict the packet from the window as if it had been delivered.
    AssumeDelivered,
    /// Abort the transfer with `RetransmitBudgetExhausted`.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub chunk_size: usize,
    pub window_size_sw: usize,
    pub window_size_gbn: usize,
    pub ack_timeout_sw_ms: u64,
    pub ack_timeout_gbn_ms: u64,
    pub max_retries_per_packet: u32,
    pub max_transfer_seconds: u64,
    pub handshake_retries: u32,
    pub handshake_step_timeout_ms: u64,
    pub idle_timeout_seconds: u64,
    pub final_ack_linger_factor: u32,
    pub exhaustion_policy: ExhaustionPolicy,
}

/// Per-transfer knobs of the windowed ARQ engine, resolved for one discipline.
#[derive(Debug, Clone)]
pub struct ArqParams {
    pub chunk_size: usize,
    pub window_size: usize,
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub max_transfer_duration: Duration,
    pub idle_timeout: Duration,
    pub linger: Duration,
    pub exhaustion_policy: ExhaustionPolicy,
}

/// Knobs of the handshake, shared by both peers.
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    pub ack_timeout: Duration,
    pub retries: u32,
    pub step_timeout: Duration,
}

impl Config {
    pub fn load_or_create(path: &PathBuf) -> Result<Self, TransferError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config.protocol.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path)?;
            tracing::info!("Created default config file at {:?}", path);
            Ok(config)
        }
    }

    pub fn save(&self, path: &PathBuf) -> Result<(), TransferError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            storage_directory: DEFAULT_STORAGE_DIRECTORY.to_string(),
            max_sessions: MAX_SESSIONS,
            session_queue_capacity: SESSION_QUEUE_CAPACITY,
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: DEFAULT_PORT,
            discipline: Discipline::StopAndWait,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            window_size_sw: WINDOW_SIZE_SW,
            window_size_gbn: WINDOW_SIZE_GBN,
            ack_timeout_sw_ms: ACK_TIMEOUT_SW_MS,
            ack_timeout_gbn_ms: ACK_TIMEOUT_GBN_MS,
            max_retries_per_packet: MAX_RETRIES_PER_PACKET,
            max_transfer_seconds: MAX_TRANSFER_SECONDS,
            handshake_retries: HANDSHAKE_RETRIES,
            handshake_step_timeout_ms: HANDSHAKE_STEP_TIMEOUT_MS,
            idle_timeout_seconds: IDLE_TIMEOUT_SECONDS,
            final_ack_linger_factor: FINAL_ACK_LINGER_FACTOR,
            exhaustion_policy: ExhaustionPolicy::AssumeDelivered,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_PAYLOAD {
            return Err(TransferError::ConfigError(format!(
                "chunk_size must be between 1 and {}, got {}",
                MAX_PAYLOAD, self.chunk_size
            )));
        }
        if self.window_size_sw == 0 || self.window_size_gbn == 0 {
            return Err(TransferError::ConfigError(
                "window sizes must be at least 1".to_string(),
            ));
        }
        if self.ack_timeout_sw_ms == 0 || self.ack_timeout_gbn_ms == 0 {
            return Err(TransferError::ConfigError(
                "ack timeouts must be non-zero".to_string(),
            ));
        }
        if self.handshake_step_timeout_ms == 0 || self.idle_timeout_seconds == 0 {
            return Err(TransferError::ConfigError(
                "handshake and idle timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn window_size(&self, discipline: Discipline) -> usize {
        match discipline {
            Discipline::StopAndWait => self.window_size_sw,
            Discipline::GoBackN => self.window_size_gbn,
        }
    }

    pub fn ack_timeout(&self, discipline: Discipline) -> Duration {
        Duration::from_millis(match discipline {
            Discipline::StopAndWait => self.ack_timeout_sw_ms,
            Discipline::GoBackN => self.ack_timeout_gbn_ms,
        })
    }

    pub fn arq_params(&self, discipline: Discipline) -> ArqParams {
        let ack_timeout = self.ack_timeout(discipline);
        ArqParams {
            chunk_size: self.chunk_size,
            window_size: self.window_size(discipline),
            ack_timeout,
            max_retries: self.max_retries_per_packet,
            max_transfer_duration: Duration::from_secs(self.max_transfer_seconds),
            idle_timeout: Duration::from_secs(self.idle_timeout_seconds),
            linger: ack_timeout * self.final_ack_linger_factor,
            exhaustion_policy: self.exhaustion_policy,
        }
    }

    pub fn handshake_params(&self, discipline: Discipline) -> HandshakeParams {
        HandshakeParams {
            ack_timeout: self.ack_timeout(discipline),
            retries: self.handshake_retries,
            step_timeout: Duration::from_millis(self.handshake_step_timeout_ms),
        }
    }
}
