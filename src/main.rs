use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::net::{lookup_host, UdpSocket};
use tracing::info;
use tracing_subscriber::EnvFilter;

use arq_drop::config::Config;
use arq_drop::handshake::Discipline;
use arq_drop::server::{accept_loop, ServerSettings};
use arq_drop::transfer::{run_download, run_upload};
use arq_drop::TransferError;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (TOML format)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Log per-packet detail
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve uploads and downloads from a storage directory
    Server {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Directory files are stored in and served from
        #[arg(long)]
        storage: Option<PathBuf>,
    },
    /// Send a local file to the server
    Upload {
        /// Local file to send
        #[arg(long)]
        src: PathBuf,
        /// Name to store it under (defaults to the source file name)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// SW (Stop-and-Wait) or GBN (Go-Back-N)
        #[arg(long)]
        protocol: Option<Discipline>,
    },
    /// Fetch a file from the server
    Download {
        /// Name of the file on the server
        #[arg(long)]
        name: String,
        /// Where to write it locally
        #[arg(long)]
        dst: PathBuf,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// SW (Stop-and-Wait) or GBN (Go-Back-N)
        #[arg(long)]
        protocol: Option<Discipline>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command {
        Commands::Server { host, port, storage } => {
            let mut settings = ServerSettings::from_config(&config);
            if let Some(storage) = storage {
                settings.storage = storage;
            }
            let host = host.unwrap_or_else(|| config.server.address.clone());
            let port = port.unwrap_or(config.server.port);

            let socket = UdpSocket::bind((host.as_str(), port)).await?;
            accept_loop(socket, settings).await?;
        }
        Commands::Upload { src, name, host, port, protocol } => {
            let name = match name {
                Some(name) => name,
                None => src
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| TransferError::ConfigError(format!("cannot derive a name from {}", src.display())))?,
            };
            let server = resolve_server(&config, host, port).await?;
            let discipline = protocol.unwrap_or(config.client.discipline);

            info!("Uploading {} to {} as {}", src.display(), server, name);
            let report = run_upload(client_socket(server).await?, server, &name, &src, discipline, &config.protocol).await?;
            println!("{}", report);
        }
        Commands::Download { name, dst, host, port, protocol } => {
            let server = resolve_server(&config, host, port).await?;
            let discipline = protocol.unwrap_or(config.client.discipline);

            info!("Downloading {} from {} into {}", name, server, dst.display());
            let report = run_download(client_socket(server).await?, server, &name, &dst, discipline, &config.protocol).await?;
            println!("{}", report);
        }
    }

    Ok(())
}

async fn resolve_server(
    config: &Config,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr, TransferError> {
    let host = host.unwrap_or_else(|| config.client.server_address.clone());
    let port = port.unwrap_or(config.client.server_port);
    let found = lookup_host((host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| TransferError::ConfigError(format!("cannot resolve {}:{}", host, port)));
    found
}

async fn client_socket(server: SocketAddr) -> Result<UdpSocket, TransferError> {
    let local = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    Ok(UdpSocket::bind(local).await?)
}
