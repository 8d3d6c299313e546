//! Frame encoding/decoding for the control socket
//!
//! Both directions share one wire shape, a big-endian u16 followed by a body:
//! ```text
//! uplink   (client -> peer):  +--------+--------+----------------------+
//!                             |   Length (2B)   |  Packet (Length B)   |
//!                             +--------+--------+----------------------+
//!
//! downlink (peer -> client):  +--------+--------+
//!                             |   Index (2B)    |
//!                             +--------+--------+
//! ```
//!
//! A downlink frame carries no body: the u16 itself is a 0-based index into
//! the manifest.

use super::TunnelError;
use crate::protocol::{ProtocolError, LENGTH_PREFIX_SIZE};
use crate::MTU;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A control socket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Raw packet captured from the tunnel interface
    Packet(Bytes),
    /// Index of the next blob to fetch
    Index(u16),
}

impl Frame {
    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        match self {
            Frame::Packet(payload) => encode_u16_length_prefixed(payload),
            Frame::Index(index) => {
                let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE);
                buf.put_u16(*index);
                Ok(buf)
            }
        }
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        match self {
            Frame::Packet(payload) => LENGTH_PREFIX_SIZE + payload.len(),
            Frame::Index(_) => LENGTH_PREFIX_SIZE,
        }
    }
}

/// Read exactly `n` bytes, issuing as many reads as needed.
///
/// A stream that ends before `n` bytes arrive yields
/// [`TunnelError::ConnectionClosed`]; a short buffer is never returned.
pub async fn read_exact<R>(source: &mut R, n: usize) -> Result<BytesMut, TunnelError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::zeroed(n);
    source
        .read_exact(&mut buf)
        .await
        .map_err(TunnelError::from_read)?;
    Ok(buf)
}

/// Prefix `payload` with its length as a big-endian u16.
///
/// Payloads above the MTU (and therefore anything above `u16::MAX`) are
/// rejected.
pub fn encode_u16_length_prefixed(payload: &[u8]) -> Result<BytesMut, TunnelError> {
    if payload.len() > MTU || payload.len() > u16::MAX as usize {
        return Err(TunnelError::FrameTooLarge(payload.len(), MTU));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Read a big-endian u16 length prefix (or index frame)
pub async fn decode_u16_length_prefix<R>(source: &mut R) -> Result<u16, TunnelError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    source
        .read_exact(&mut len_buf)
        .await
        .map_err(TunnelError::from_read)?;
    Ok(u16::from_be_bytes(len_buf))
}

/// Read one uplink frame and return its packet.
///
/// Lengths above the MTU are a protocol violation.
pub async fn read_packet_frame<R>(source: &mut R) -> Result<Bytes, TunnelError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = decode_u16_length_prefix(source).await? as usize;
    if len > MTU {
        return Err(ProtocolError::PacketTooLarge(len, MTU).into());
    }
    Ok(read_exact(source, len).await?.freeze())
}
