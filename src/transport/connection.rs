//! Client-side tunnel connection
//!
//! Handles the lifecycle of one session:
//! - TCP connect to the peer
//! - Manifest handshake (must complete before any forwarding starts)
//! - Handing the socket and interface to the session supervisor

use super::{connect_tcp, TransportConfig};
use crate::storage::BlobSource;
use crate::tunnel::{
    read_manifest, BlobErrorPolicy, Manifest, Session, SessionReport, TunnelError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A connected, handshaken tunnel that has not started forwarding yet
pub struct TunnelConnection<S, D> {
    socket: S,
    device: D,
    manifest: Manifest,
    source: Arc<dyn BlobSource>,
    policy: BlobErrorPolicy,
}

impl<D> TunnelConnection<TcpStream, D>
where
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Connect to `host:port` and perform the handshake.
    ///
    /// On failure the interface handle is dropped and nothing is forwarded.
    pub async fn connect(
        host: &str,
        port: u16,
        device: D,
        source: Arc<dyn BlobSource>,
        config: &TransportConfig,
    ) -> crate::Result<Self> {
        info!("Connecting to {}:{}", host, port);
        let socket = connect_tcp(host, port, config).await?;
        Ok(Self::establish(socket, device, source, config).await?)
    }
}

impl<S, D> TunnelConnection<S, D>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Perform the handshake over an already open control socket
    pub async fn establish(
        mut socket: S,
        device: D,
        source: Arc<dyn BlobSource>,
        config: &TransportConfig,
    ) -> Result<Self, TunnelError> {
        let manifest = handshake(&mut socket, config).await?;
        info!("Handshake complete: {} manifest entries", manifest.len());

        Ok(Self {
            socket,
            device,
            manifest,
            source,
            policy: BlobErrorPolicy::default(),
        })
    }

    /// Set how unfetchable or malformed blobs are handled
    pub fn with_blob_error_policy(mut self, policy: BlobErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Manifest received during the handshake
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Forward traffic until a loop fails or `cancel` fires.
    ///
    /// The socket and interface are released before this returns.
    pub async fn run(self, cancel: CancellationToken) -> SessionReport {
        Session::new(self.manifest, self.source)
            .with_blob_error_policy(self.policy)
            .run(self.socket, self.device, cancel)
            .await
    }
}

/// Read the manifest from a fresh control socket, bounded by the handshake timeout
pub async fn handshake<S>(socket: &mut S, config: &TransportConfig) -> Result<Manifest, TunnelError>
where
    S: AsyncRead + Unpin,
{
    let timeout = Duration::from_secs(config.handshake_timeout);
    tokio::time::timeout(timeout, read_manifest(socket, config.max_manifest_bytes))
        .await
        .map_err(|_| TunnelError::Timeout("handshake"))?
}
