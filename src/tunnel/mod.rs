//! Tunnel layer - the core of the system
//!
//! Provides:
//! - Frame encoding/decoding for the control socket
//! - Manifest handshake
//! - Blob chunk unpacking
//! - Uplink and downlink forwarding loops
//! - The session supervisor that owns both loops

mod chunk;
mod downlink;
mod frame;
mod manifest;
mod session;
#[cfg(test)]
pub(crate) mod testing;
mod uplink;

pub use chunk::{encode_blob, Chunk, ChunkReader};
pub use downlink::{BlobErrorPolicy, DownlinkDispatcher};
pub use frame::{
    decode_u16_length_prefix, encode_u16_length_prefixed, read_exact, read_packet_frame, Frame,
};
pub use manifest::{read_manifest, write_manifest, Manifest};
pub use session::{LoopKind, Session, SessionReport, SessionStats, Termination};
pub(crate) use session::{finish_report, supervise};
pub use uplink::UplinkForwarder;

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Tunnel interface closed")]
    DeviceClosed,

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("Blob error: {0}")]
    Blob(#[from] crate::storage::BlobError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Loop task failed: {0}")]
    Join(String),
}

impl TunnelError {
    /// Map a read error, turning a premature end of stream into `ConnectionClosed`
    pub(crate) fn from_read(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TunnelError::ConnectionClosed
        } else {
            TunnelError::Io(e)
        }
    }
}
