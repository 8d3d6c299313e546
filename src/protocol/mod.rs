//! Protocol definitions and constants

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Manifest too large: {len} bytes (limit {limit})")]
    ManifestTooLarge { len: usize, limit: usize },

    #[error("Manifest is not valid UTF-8: {0}")]
    InvalidManifest(#[from] std::string::FromUtf8Error),

    #[error("Manifest index {index} out of range (manifest has {len} entries)")]
    IndexOutOfRange { index: u16, len: usize },

    #[error("Packet too large: {0} bytes (MTU {1})")]
    PacketTooLarge(usize, usize),

    #[error("Malformed blob {id}: {reason}")]
    MalformedBlob { id: String, reason: String },
}

/// Size of the handshake length prefix (big-endian u32)
pub const MANIFEST_LEN_SIZE: usize = 4;

/// Size of every frame and chunk length prefix (big-endian u16)
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Default cap on the manifest blob accepted during the handshake (4 MB)
pub const DEFAULT_MAX_MANIFEST_BYTES: usize = 4 * 1024 * 1024;

/// Handshake timeout in seconds
pub const HANDSHAKE_TIMEOUT: u64 = 30;

/// Connect timeout in seconds
pub const CONNECT_TIMEOUT: u64 = 30;

/// Blob fetch timeout in seconds
pub const BLOB_FETCH_TIMEOUT: u64 = 60;

/// Blob store timeout in seconds
pub const BLOB_STORE_TIMEOUT: u64 = 60;
