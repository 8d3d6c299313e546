//! Chunk framing inside a fetched blob
//!
//! A blob is a plain concatenation of chunks, each one a packet bound for
//! the tunnel interface:
//! ```text
//! +--------+--------+-----------+--------+--------+-----------+----
//! |   Length (2B)   |  Packet   |   Length (2B)   |  Packet   | ...
//! +--------+--------+-----------+--------+--------+-----------+----
//! ```
//! There is no count and no trailer. The blob ends where the stream can no
//! longer supply a whole length prefix.

use super::frame::encode_u16_length_prefixed;
use super::TunnelError;
use crate::protocol::{ProtocolError, LENGTH_PREFIX_SIZE};
use crate::storage::BlobError;
use crate::MTU;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

/// One step of blob consumption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// A reconstituted packet (may be empty)
    Packet(Bytes),
    /// No more chunks in this blob
    End,
}

/// Yields the chunks of one blob stream in order
pub struct ChunkReader<R> {
    id: String,
    reader: R,
    finished: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    /// Create a reader over the content of blob `id`
    pub fn new(id: impl Into<String>, reader: R) -> Self {
        Self {
            id: id.into(),
            reader,
            finished: false,
        }
    }

    /// Identifier of the blob being read
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read the next chunk.
    ///
    /// Returns [`Chunk::End`] once the stream is exhausted, including when it
    /// stops inside a length prefix or a payload. Errors are reserved for
    /// the storage stream failing and for chunk lengths above the MTU.
    pub async fn next_chunk(&mut self) -> Result<Chunk, TunnelError> {
        if self.finished {
            return Ok(Chunk::End);
        }

        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        let got = self.fill(&mut len_buf).await?;
        if got < LENGTH_PREFIX_SIZE {
            if got > 0 {
                warn!("Blob {} ends with {} stray byte(s)", self.id, got);
            }
            return Ok(self.finish());
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        if len > MTU {
            self.finished = true;
            return Err(ProtocolError::MalformedBlob {
                id: self.id.clone(),
                reason: format!("chunk of {} bytes exceeds MTU {}", len, MTU),
            }
            .into());
        }

        let mut payload = BytesMut::zeroed(len);
        let got = self.fill(&mut payload).await?;
        if got < len {
            warn!(
                "Blob {} truncated inside a chunk ({} of {} bytes), dropping it",
                self.id, got, len
            );
            return Ok(self.finish());
        }

        Ok(Chunk::Packet(payload.freeze()))
    }

    fn finish(&mut self) -> Chunk {
        self.finished = true;
        Chunk::End
    }

    /// Read until `buf` is full or the stream ends; returns bytes read
    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .reader
                .read(&mut buf[filled..])
                .await
                .map_err(|source| BlobError::Read {
                    id: self.id.clone(),
                    source,
                })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// Pack packets into blob content using the chunk framing
pub fn encode_blob<I, P>(packets: I) -> Result<Bytes, TunnelError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut buf = BytesMut::new();
    for packet in packets {
        buf.extend_from_slice(&encode_u16_length_prefixed(packet.as_ref())?);
    }
    Ok(buf.freeze())
}
