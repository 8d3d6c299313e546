//! Peer side of one tunnel session
//!
//! ```text
//!   inbound:  socket (uplink frames) -> interface
//!   outbound: interface -> batcher -> blob slot store -> socket (index frames)
//! ```

use super::batcher::{BatchLimits, PacketBatcher};
use crate::config::ServerConfig;
use crate::storage::{self, BlobSink};
use crate::tunnel::{
    finish_report, read_packet_frame, supervise, write_manifest, Frame, Manifest, SessionReport,
    SessionStats, TunnelError,
};
use crate::MTU;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Serves tunnel sessions over a fixed set of blob slots
pub struct RelaySession {
    slots: Manifest,
    sink: Arc<dyn BlobSink>,
    limits: BatchLimits,
}

impl RelaySession {
    /// Create a relay writing to `sink`; `slots` is the manifest sent to clients
    pub fn new(slots: Manifest, sink: Arc<dyn BlobSink>, limits: BatchLimits) -> crate::Result<Self> {
        if slots.is_empty() || slots.len() > u16::MAX as usize + 1 {
            return Err(crate::Error::Config(format!(
                "Slot count must be between 1 and 65536, got {}",
                slots.len()
            )));
        }
        if limits.max_packets == 0 {
            return Err(crate::Error::Config(
                "max_queued_packets must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            slots,
            sink,
            limits,
        })
    }

    /// Relay storing blobs in the `[server] sink` backend
    pub fn from_config(config: &ServerConfig) -> crate::Result<Self> {
        let sink = storage::sink_from_config(&config.sink, config.store_timeout())?;
        Self::new(
            Manifest::new(config.slot_ids()),
            sink,
            BatchLimits {
                window: config.batch_window(),
                max_packets: config.max_queued_packets,
            },
        )
    }

    /// Manifest advertised to clients
    pub fn slots(&self) -> &Manifest {
        &self.slots
    }

    /// Send the manifest, then relay traffic until a loop stops or `cancel` fires
    pub async fn serve<S, D>(
        &self,
        mut socket: S,
        device: D,
        cancel: CancellationToken,
    ) -> Result<SessionReport, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        write_manifest(&mut socket, &self.slots).await?;
        info!("Manifest sent: {} slots", self.slots.len());

        let stats = Arc::new(SessionStats::default());
        let (mut socket_rx, mut socket_tx) = tokio::io::split(socket);
        let (mut device_rx, mut device_tx) = tokio::io::split(device);
        let (batcher, packet_tx, index_rx) = PacketBatcher::new(
            Arc::clone(&self.sink),
            self.slots.clone(),
            self.limits,
            Arc::clone(&stats),
        );

        let token = cancel.child_token();

        let inbound = {
            let token = token.clone();
            let stats = Arc::clone(&stats);
            async move {
                let result = forward_frames(&mut socket_rx, &mut device_tx, &token, &stats).await;
                (result, device_tx)
            }
        };

        let outbound = {
            let token = token.clone();
            let stats = Arc::clone(&stats);
            async move {
                let result = tokio::try_join!(
                    read_packets(&mut device_rx, packet_tx, &token, &stats),
                    batcher.run(&token),
                    send_indices(&mut socket_tx, index_rx, &token, &stats),
                )
                .map(|_| ());
                (result, socket_tx)
            }
        };

        let (termination, device_tx, socket_tx) =
            supervise(inbound, outbound, &cancel, &token).await;

        drop(device_tx);
        if let Some(mut socket_tx) = socket_tx {
            if let Err(e) = socket_tx.shutdown().await {
                debug!("Control socket shutdown: {}", e);
            }
        }

        Ok(finish_report(&stats, termination))
    }
}

/// Uplink frames from the client onto the interface
async fn forward_frames<R, W>(
    socket: &mut R,
    device: &mut W,
    cancel: &CancellationToken,
    stats: &SessionStats,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = read_packet_frame(socket) => frame?,
        };
        if packet.is_empty() {
            continue;
        }

        device.write_all(&packet).await?;
        device.flush().await?;
        trace!("Inbound packet: {} bytes", packet.len());
        stats.record_uplink(packet.len());
    }
    Ok(())
}

/// Interface packets into the batcher
async fn read_packets<R>(
    device: &mut R,
    packets: mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
    stats: &SessionStats,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MTU];
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = device.read(&mut buf) => read?,
        };
        if n == 0 {
            return Err(TunnelError::DeviceClosed);
        }

        let packet = Bytes::copy_from_slice(&buf[..n]);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = packets.send(packet) => {
                sent.map_err(|_| TunnelError::Join("packet batcher stopped".to_string()))?
            }
        }
        stats.record_downlink(n);
    }
    Ok(())
}

/// Stored slot indices onto the control socket
async fn send_indices<W>(
    socket: &mut W,
    mut indices: mpsc::Receiver<u16>,
    cancel: &CancellationToken,
    stats: &SessionStats,
) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let index = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            index = indices.recv() => match index {
                Some(index) => index,
                None => break,
            },
        };

        let frame = Frame::Index(index).encode()?;
        socket.write_all(&frame).await?;
        socket.flush().await?;
        trace!("Index frame {}", index);
        stats.record_index();
    }
    Ok(())
}
