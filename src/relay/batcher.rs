//! Packet batcher: interface packets -> blob slots -> index frames
//!
//! Packets are collected for one batch window (starting at the first packet
//! of a batch) or until the batch is full, encoded with the chunk framing and
//! stored into the next slot of the manifest. The slot index is emitted only
//! after the store has completed, so a client never fetches a slot before its
//! content is in place.

use crate::storage::BlobSink;
use crate::tunnel::{encode_blob, Manifest, SessionStats, TunnelError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Batching limits
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    /// How long a batch stays open after its first packet
    pub window: Duration,
    /// Packets after which a batch is flushed early
    pub max_packets: usize,
}

/// Turns a stream of packets into stored blobs and slot indices
pub struct PacketBatcher {
    packets: mpsc::Receiver<Bytes>,
    indices: mpsc::Sender<u16>,
    sink: Arc<dyn BlobSink>,
    slots: Manifest,
    next_slot: u16,
    limits: BatchLimits,
    stats: Arc<SessionStats>,
}

impl PacketBatcher {
    /// Create a batcher over `slots`, returning the packet input and index output
    pub fn new(
        sink: Arc<dyn BlobSink>,
        slots: Manifest,
        limits: BatchLimits,
        stats: Arc<SessionStats>,
    ) -> (Self, mpsc::Sender<Bytes>, mpsc::Receiver<u16>) {
        let capacity = limits.max_packets.max(1);
        let (packet_tx, packet_rx) = mpsc::channel(capacity);
        let (index_tx, index_rx) = mpsc::channel(slots.len().max(1));

        let batcher = Self {
            packets: packet_rx,
            indices: index_tx,
            sink,
            slots,
            next_slot: 0,
            limits,
            stats,
        };
        (batcher, packet_tx, index_rx)
    }

    /// Batch packets until the input closes, `cancel` fires or the index
    /// receiver goes away
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        info!(
            "Packet batcher started ({} slots, window {:?}, up to {} packets)",
            self.slots.len(),
            self.limits.window,
            self.limits.max_packets
        );

        loop {
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                packet = self.packets.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };

            let mut batch = vec![first];
            let deadline = Instant::now() + self.limits.window;
            let mut input_closed = false;

            while batch.len() < self.limits.max_packets {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep_until(deadline) => break,
                    packet = self.packets.recv() => match packet {
                        Some(packet) => batch.push(packet),
                        None => {
                            input_closed = true;
                            break;
                        }
                    },
                }
            }

            self.flush(batch).await?;
            if input_closed {
                break;
            }
        }

        debug!("Packet batcher stopped");
        Ok(())
    }

    /// Store one batch in the next slot and announce it
    async fn flush(&mut self, batch: Vec<Bytes>) -> Result<(), TunnelError> {
        let index = self.next_slot;
        self.next_slot = index
            .checked_add(1)
            .filter(|next| (*next as usize) < self.slots.len())
            .unwrap_or(0);

        let id = self.slots.get(index)?;
        let blob = encode_blob(&batch)?;
        let size = blob.len();

        match self.sink.store(id, blob).await {
            Ok(()) => {
                debug!(
                    "Stored {} packet(s), {} bytes in slot {} ({})",
                    batch.len(),
                    size,
                    index,
                    id
                );
                self.stats.record_blob();
                self.indices
                    .send(index)
                    .await
                    .map_err(|_| TunnelError::ConnectionClosed)?;
            }
            Err(e) => {
                error!(
                    "Failed storing slot {} ({}), dropping {} packet(s): {}",
                    index,
                    id,
                    batch.len(),
                    e
                );
                self.stats.record_blob_failure();
            }
        }
        Ok(())
    }
}
