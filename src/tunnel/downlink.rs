//! Downlink dispatcher: index frames -> blob fetch -> tunnel interface
//!
//! For every index frame on the control socket:
//! 1. resolve the index through the manifest (out of range is fatal)
//! 2. fetch the blob from the blob source
//! 3. write each chunk of the blob to the interface as one packet
//!
//! Blobs are drained one at a time, so packets reach the interface in index
//! order.

use super::chunk::{Chunk, ChunkReader};
use super::frame::decode_u16_length_prefix;
use super::manifest::Manifest;
use super::session::SessionStats;
use super::TunnelError;
use crate::protocol::ProtocolError;
use crate::storage::BlobSource;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How a blob that cannot be fetched or parsed is handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobErrorPolicy {
    /// Log a warning and wait for the next index
    #[default]
    Skip,
    /// End the session
    Abort,
}

/// Turns index frames into packets on the tunnel interface
pub struct DownlinkDispatcher<R, W> {
    socket: R,
    device: W,
    manifest: Manifest,
    source: Arc<dyn BlobSource>,
    policy: BlobErrorPolicy,
    stats: Arc<SessionStats>,
}

impl<R, W> DownlinkDispatcher<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a dispatcher reading index frames from `socket`
    pub fn new(
        socket: R,
        device: W,
        manifest: Manifest,
        source: Arc<dyn BlobSource>,
        policy: BlobErrorPolicy,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            socket,
            device,
            manifest,
            source,
            policy,
            stats,
        }
    }

    /// Dispatch index frames until `cancel` fires or a fatal error occurs
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        info!(
            "Downlink dispatcher started ({} manifest entries)",
            self.manifest.len()
        );

        loop {
            let index = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                index = decode_u16_length_prefix(&mut self.socket) => index?,
            };

            let id = self.manifest.get(index)?.to_string();
            trace!("Index frame {} -> blob {}", index, id);
            self.stats.record_index();

            match self.forward_blob(&id, cancel).await {
                Ok(Some(packets)) => {
                    debug!("Blob {} (index {}): {} packet(s)", id, index, packets);
                    self.stats.record_blob();
                }
                Ok(None) => break,
                Err(e) if is_blob_failure(&e) && self.policy == BlobErrorPolicy::Skip => {
                    warn!("Skipping blob {} (index {}): {}", id, index, e);
                    self.stats.record_blob_failure();
                }
                Err(e) => return Err(e),
            }
        }

        debug!("Downlink dispatcher stopped");
        Ok(())
    }

    /// Stream one blob onto the interface; `None` if cancelled midway
    async fn forward_blob(
        &mut self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>, TunnelError> {
        let reader = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            reader = self.source.fetch(id) => reader?,
        };

        let mut chunks = ChunkReader::new(id, reader);
        let mut packets = 0;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                chunk = chunks.next_chunk() => chunk?,
            };

            let packet = match chunk {
                Chunk::End => break,
                Chunk::Packet(packet) if packet.is_empty() => {
                    trace!("Empty chunk in blob {}, nothing to write", chunks.id());
                    continue;
                }
                Chunk::Packet(packet) => packet,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                written = write_packet(&mut self.device, &packet) => written?,
            }
            self.stats.record_downlink(packet.len());
            packets += 1;
        }

        Ok(Some(packets))
    }

    /// Give back the socket and interface halves
    pub fn into_inner(self) -> (R, W) {
        (self.socket, self.device)
    }
}

/// Failures confined to one blob, as opposed to the session's own I/O
fn is_blob_failure(error: &TunnelError) -> bool {
    matches!(
        error,
        TunnelError::Blob(_) | TunnelError::Protocol(ProtocolError::MalformedBlob { .. })
    )
}

async fn write_packet<W>(device: &mut W, packet: &[u8]) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    device.write_all(packet).await?;
    device.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlobError, MemoryBlobStore};
    use crate::tunnel::chunk::encode_blob;
    use crate::tunnel::testing::MockDevice;

    fn store_with(blobs: &[(&str, Vec<Vec<u8>>)]) -> Arc<MemoryBlobStore> {
        let store = MemoryBlobStore::new();
        for (id, packets) in blobs {
            store.insert(*id, encode_blob(packets).unwrap());
        }
        Arc::new(store)
    }

    fn dispatcher<'a>(
        indices: &'a [u8],
        device: MockDevice,
        store: Arc<MemoryBlobStore>,
        policy: BlobErrorPolicy,
    ) -> (DownlinkDispatcher<&'a [u8], MockDevice>, Arc<SessionStats>) {
        let stats = Arc::new(SessionStats::default());
        let dispatcher = DownlinkDispatcher::new(
            indices,
            device,
            Manifest::new(["blob-a", "blob-b", "blob-c"]),
            store,
            policy,
            Arc::clone(&stats),
        );
        (dispatcher, stats)
    }

    #[tokio::test]
    async fn test_index_fans_out_to_packets_in_order() {
        let store = store_with(&[
            ("blob-a", vec![vec![1; 40], vec![2; 41], vec![3; 42]]),
            ("blob-b", vec![vec![4; 50]]),
        ]);
        let (device, log) = MockDevice::packets(vec![]);
        let indices = [0x00, 0x00, 0x00, 0x01];
        let (mut downlink, stats) =
            dispatcher(&indices, device, store, BlobErrorPolicy::Skip);

        // Socket ends after the second index frame
        let err = downlink.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TunnelError::ConnectionClosed));

        let written = log.written();
        assert_eq!(
            written,
            vec![vec![1; 40], vec![2; 41], vec![3; 42], vec![4; 50]]
        );
        let report = stats.snapshot();
        assert_eq!(report.index_frames, 2);
        assert_eq!(report.downlink_packets, 4);
        assert_eq!(report.blobs, 2);
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_protocol_violation() {
        let store = store_with(&[("blob-a", vec![vec![1; 10]])]);
        let (device, log) = MockDevice::packets(vec![]);
        let indices = [0x00, 0x03];
        let (mut downlink, _stats) = dispatcher(&indices, device, store, BlobErrorPolicy::Skip);

        let err = downlink.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Protocol(ProtocolError::IndexOutOfRange { index: 3, len: 3 })
        ));
        assert_eq!(log.write_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_blob_skipped() {
        let store = store_with(&[("blob-c", vec![vec![9; 12]])]);
        let (device, log) = MockDevice::packets(vec![]);
        // blob-b is missing, blob-c is present
        let indices = [0x00, 0x01, 0x00, 0x02];
        let (mut downlink, stats) = dispatcher(&indices, device, store, BlobErrorPolicy::Skip);

        let err = downlink.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TunnelError::ConnectionClosed));
        assert_eq!(log.written(), vec![vec![9; 12]]);
        assert_eq!(stats.snapshot().blobs_failed, 1);
    }

    #[tokio::test]
    async fn test_missing_blob_aborts_when_configured() {
        let store = store_with(&[]);
        let (device, log) = MockDevice::packets(vec![]);
        let indices = [0x00, 0x01];
        let (mut downlink, _stats) = dispatcher(&indices, device, store, BlobErrorPolicy::Abort);

        let err = downlink.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Blob(BlobError::NotFound(ref id)) if id == "blob-b"
        ));
        assert_eq!(log.write_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_blob_skipped_after_valid_prefix() {
        let store = MemoryBlobStore::new();
        let mut content = encode_blob([vec![7u8; 8]]).unwrap().to_vec();
        content.extend_from_slice(&[0xFF, 0xFF]); // 65535 > MTU
        store.insert("blob-a", content);
        store.insert("blob-b", encode_blob([vec![8u8; 4]]).unwrap());

        let (device, log) = MockDevice::packets(vec![]);
        let indices = [0x00, 0x00, 0x00, 0x01];
        let (mut downlink, stats) =
            dispatcher(&indices, device, Arc::new(store), BlobErrorPolicy::Skip);

        let _ = downlink.run(&CancellationToken::new()).await;
        assert_eq!(log.written(), vec![vec![7u8; 8], vec![8u8; 4]]);
        assert_eq!(stats.snapshot().blobs_failed, 1);
    }

    #[tokio::test]
    async fn test_empty_chunks_not_written() {
        let store = store_with(&[("blob-a", vec![vec![], vec![5; 3], vec![]])]);
        let (device, log) = MockDevice::packets(vec![]);
        let indices = [0x00, 0x00];
        let (mut downlink, _stats) = dispatcher(&indices, device, store, BlobErrorPolicy::Skip);

        let _ = downlink.run(&CancellationToken::new()).await;
        assert_eq!(log.written(), vec![vec![5; 3]]);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_index() {
        let store = store_with(&[]);
        let (device, _log) = MockDevice::packets(vec![]);
        let (socket, _peer) = tokio::io::duplex(64);
        let stats = Arc::new(SessionStats::default());
        let mut downlink = DownlinkDispatcher::new(
            socket,
            device,
            Manifest::new(["blob-a"]),
            store,
            BlobErrorPolicy::Skip,
            stats,
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        downlink.run(&cancel).await.unwrap();
    }
}
