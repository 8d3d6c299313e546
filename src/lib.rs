//! # Blob Tunnel
//!
//! Tunnels IP packets from a local virtual interface to a remote peer over a
//! single TCP control socket, while the bulk of the downstream traffic travels
//! as ordinary object-storage downloads.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  uplink frames (u16 len + packet)   ┌──────────────┐
//! │              │ ───────────────────────────────────▶│              │
//! │  local tun   │                                     │     peer     │
//! │  interface   │◀─── index frames (u16 manifest idx) │   (relay)    │
//! │              │                                     │              │
//! └──────▲───────┘                                     └──────┬───────┘
//!        │ chunks (u16 len + packet)                          │ store
//!        │                ┌──────────────────┐                │
//!        └──────fetch─────│    blob store    │◀───────────────┘
//!                         └──────────────────┘
//! ```
//!
//! - [`tunnel`]: frame codec, manifest handshake, the two forwarding loops
//!   and the session supervisor that owns them.
//! - [`storage`]: the blob source/sink capabilities and their backends.
//! - [`transport`]: TCP connect and the client-side tunnel connection.
//! - [`relay`]: the peer side, which batches packets into blobs and sends
//!   index frames.
//!
//! Neither the control socket nor blob content is encrypted.

pub mod config;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod storage;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Link MTU; no packet on the wire or inside a blob may exceed it
pub const MTU: usize = 1500;

/// Default control port
pub const DEFAULT_PORT: u16 = 42069;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::BlobError),

    #[error("Configuration error: {0}")]
    Config(String),
}
