//! Transport layer
//!
//! Provides:
//! - TCP connect for the control socket
//! - The client-side tunnel connection (connect, handshake, run)
//! - Adoption of an already-configured tunnel interface descriptor

mod connection;
#[cfg(unix)]
mod device;
mod tcp;

pub use connection::{handshake, TunnelConnection};
#[cfg(unix)]
pub use device::TunDevice;
pub use tcp::connect_tcp;

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout")]
    Timeout,
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Handshake timeout in seconds
    pub handshake_timeout: u64,
    /// Largest manifest accepted during the handshake
    pub max_manifest_bytes: usize,
    /// Disable Nagle's algorithm on the control socket
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: crate::protocol::CONNECT_TIMEOUT,
            handshake_timeout: crate::protocol::HANDSHAKE_TIMEOUT,
            max_manifest_bytes: crate::protocol::DEFAULT_MAX_MANIFEST_BYTES,
            nodelay: true,
        }
    }
}
