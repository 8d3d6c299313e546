//! TCP connect for the control socket

use super::{TransportConfig, TransportError};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Open the control socket to `host:port`
pub async fn connect_tcp(
    host: &str,
    port: u16,
    config: &TransportConfig,
) -> Result<TcpStream, TransportError> {
    let timeout = Duration::from_secs(config.connect_timeout);

    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?;

    // Length prefixes and index frames are tiny; don't let Nagle hold them back
    if config.nodelay {
        stream.set_nodelay(true).ok();
    }

    debug!(
        "Connected to {}:{} from {}",
        host,
        port,
        stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string())
    );
    Ok(stream)
}
