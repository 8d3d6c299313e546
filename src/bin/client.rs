//! Blob Tunnel Client
//!
//! Adopts an already configured tunnel interface, connects to the relay and:
//! - forwards every packet read from the interface as an uplink frame
//! - turns every index frame into a blob download whose chunks are written
//!   back to the interface

use anyhow::{anyhow, Context, Result};
use blob_tunnel::{
    config::{generate_example_config, Config},
    logging, storage,
    transport::TunnelConnection,
    tunnel::Termination,
};
#[cfg(unix)]
use blob_tunnel::transport::TunDevice;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Blob Tunnel Client - packets up the socket, blobs down from storage
#[derive(Parser, Debug)]
#[command(name = "blob-client")]
#[command(about = "Blob Tunnel Client - tunnels packets through object-storage downloads")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example_config: bool,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Open tunnel interface descriptor inherited from the parent process
    #[arg(long)]
    tun_fd: Option<i32>,

    /// Log level or filter directive (overrides config and RUST_LOG)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[cfg(not(unix))]
fn main() -> Result<()> {
    Err(anyhow!("blob-client needs a unix tunnel interface descriptor"))
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

    let mut client_config = config
        .client
        .clone()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    if let Some(server) = args.server {
        client_config.server = server;
    }

    let (host, port) = client_config.host_port()?;
    let source = storage::from_config(&client_config.blobs, client_config.blob_fetch_timeout())
        .context("Failed to set up blob source")?;

    let fd = args
        .tun_fd
        .ok_or_else(|| anyhow!("--tun-fd is required"))?;
    let device = open_device(fd)?;

    info!("Blob Tunnel Client v{}", blob_tunnel::VERSION);
    let connection = TunnelConnection::connect(
        &host,
        port,
        device,
        source,
        &client_config.transport_config(),
    )
    .await
    .context("Failed to establish tunnel")?
    .with_blob_error_policy(client_config.on_blob_error);

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

    let report = connection.run(cancel).await;
    if let Some(Termination::Finished(side)) = &report.termination {
        warn!("{} loop ended without an error", side);
    }
    report.into_result().context("Tunnel session failed")?;
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
