pub mod arq;
pub mod config;
pub mod error;
pub mod handshake;
pub mod packet;
pub mod server;
pub mod session;
pub mod simulator;
pub mod stream;
pub mod transfer;
pub mod transport;
pub mod window;
pub mod writer;

pub use config::{Config, ExhaustionPolicy, ProtocolConfig};
pub use error::TransferError;
pub use handshake::{Direction, Discipline};
pub use server::{accept_loop, ServerSettings};
pub use transfer::{run_download, run_upload, TransferReport};
pub use transport::{Inbound, Link, PeerLink};

// Re-export commonly used types
pub use tokio;
pub use bytes;
