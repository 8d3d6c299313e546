//! Address manifest and the handshake that carries it
//!
//! Handshake format (peer -> client, once, before any other frame):
//! ```text
//! +--------+--------+--------+--------+------------------------------+
//! |          Length L (4B, BE)        |  L bytes UTF-8, '\n'-joined  |
//! +--------+--------+--------+--------+------------------------------+
//! ```

use super::frame::read_exact;
use super::TunnelError;
use crate::protocol::{ProtocolError, MANIFEST_LEN_SIZE};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Ordered, index-addressable list of blob identifiers.
///
/// Immutable once built; clones share the same storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    ids: Arc<[String]>,
}

impl Manifest {
    /// Build a manifest from identifiers
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse newline-separated handshake text.
    ///
    /// Empty entries at the end (from a trailing newline) are dropped, so
    /// empty text yields an empty manifest.
    pub fn parse(text: &str) -> Self {
        let mut ids: Vec<&str> = text.split('\n').collect();
        while ids.last().is_some_and(|id| id.is_empty()) {
            ids.pop();
        }
        Self::new(ids)
    }

    /// Resolve an index frame to a blob identifier
    pub fn get(&self, index: u16) -> Result<&str, ProtocolError> {
        self.ids
            .get(index as usize)
            .map(String::as_str)
            .ok_or(ProtocolError::IndexOutOfRange {
                index,
                len: self.ids.len(),
            })
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if the manifest has no entries
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterate over identifiers in index order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Handshake text for this manifest
    pub fn to_text(&self) -> String {
        self.ids.join("\n")
    }
}

/// Read the handshake and build the manifest.
///
/// Any failure aborts the handshake; no partial manifest is produced.
pub async fn read_manifest<R>(source: &mut R, max_len: usize) -> Result<Manifest, TunnelError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; MANIFEST_LEN_SIZE];
    source
        .read_exact(&mut len_buf)
        .await
        .map_err(TunnelError::from_read)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_len {
        return Err(ProtocolError::ManifestTooLarge {
            len,
            limit: max_len,
        }
        .into());
    }

    let body = read_exact(source, len).await?;
    let text = String::from_utf8(body.to_vec()).map_err(ProtocolError::from)?;
    let manifest = Manifest::parse(&text);

    debug!("Manifest received: {} bytes, {} entries", len, manifest.len());
    Ok(manifest)
}

/// Send the handshake for `manifest`
pub async fn write_manifest<W>(sink: &mut W, manifest: &Manifest) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let text = manifest.to_text();
    let len = u32::try_from(text.len()).map_err(|_| ProtocolError::ManifestTooLarge {
        len: text.len(),
        limit: u32::MAX as usize,
    })?;

    sink.write_all(&len.to_be_bytes()).await?;
    sink.write_all(text.as_bytes()).await?;
    sink.flush().await?;
    Ok(())
}
