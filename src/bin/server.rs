//! Blob Tunnel Server (relay)
//!
//! Accepts one client at a time and:
//! - writes the client's uplink frames to its own tunnel interface
//! - batches packets read from that interface into blob slots and sends the
//!   client one index frame per stored slot

use anyhow::{anyhow, Context, Result};
use blob_tunnel::{
    config::{generate_example_config, BlobSinkConfig, Config},
    logging,
    relay::RelaySession,
};
#[cfg(unix)]
use blob_tunnel::transport::TunDevice;
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Blob Tunnel Server - relays packets through object-storage uploads
#[derive(Parser, Debug)]
#[command(name = "blob-server")]
#[command(about = "Blob Tunnel Server - relays packets through object-storage uploads")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Write blobs to this directory (overrides the configured sink)
    #[arg(long)]
    blob_dir: Option<PathBuf>,

    /// Open tunnel interface descriptor inherited from the parent process
    #[arg(long)]
    tun_fd: Option<i32>,

    /// Log level or filter directive (overrides config and RUST_LOG)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[cfg(not(unix))]
fn main() -> Result<()> {
    Err(anyhow!("blob-server needs a unix tunnel interface descriptor"))
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_example_config {
        print!("{}", toml::to_string_pretty(&generate_example_config())?);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    logging::init(&config.logging, args.log_level.as_deref())
        .context("Failed to initialize logging")?;

    let mut server_config = config.server.clone().unwrap_or_default();
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    if let Some(blob_dir) = args.blob_dir {
        server_config.sink = BlobSinkConfig::Dir { path: blob_dir };
    }

    let relay = RelaySession::from_config(&server_config).context("Invalid [server] section")?;
    let fd = args
        .tun_fd
        .ok_or_else(|| anyhow!("--tun-fd is required"))?;
    let device = open_device(fd)?;

    let listener = TcpListener::bind(&server_config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", server_config.listen))?;
    let sink = match &server_config.sink {
        BlobSinkConfig::Dir { path } => path.display().to_string(),
        BlobSinkConfig::Http { url_template, .. } => url_template.clone(),
    };
    info!(
        "Blob Tunnel Server v{} listening on {} ({} slots in {})",
        blob_tunnel::VERSION,
        server_config.listen,
        relay.slots().len(),
        sink
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    // One client at a time: the interface is shared by every session
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted.context("Accept failed")?,
        };
        info!("New connection: {}", peer);
        if let Err(e) = socket.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let session_device = device
            .try_clone()
            .context("Failed to duplicate tunnel descriptor")?;

        match relay.serve(socket, session_device, cancel.clone()).await {
            Ok(report) => match report.error() {
                Some(e) => warn!("Disconnected {}: {}", peer, e),
                None => info!("Disconnected {}", peer),
            },
            Err(e) => error!("Handshake with {} failed: {}", peer, e),
        }
    }

    Ok(())
}

#[cfg(unix)]
fn open_device(fd: i32) -> Result<TunDevice> {
    if fd < 0 {
        return Err(anyhow!("Invalid tunnel descriptor: {}", fd));
    }
    // SAFETY: the descriptor is handed over by the launching process and is
    // not used anywhere else in this process
    unsafe { TunDevice::from_raw_fd(fd) }
        .with_context(|| format!("Failed to adopt tunnel descriptor {}", fd))
}
