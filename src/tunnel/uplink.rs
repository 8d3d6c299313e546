//! Uplink forwarder: tunnel interface -> control socket

use super::frame::encode_u16_length_prefixed;
use super::session::SessionStats;
use super::TunnelError;
use crate::MTU;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Pause after a read that produced no packet
const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(5);

/// Frames each packet read from the interface onto the control socket.
///
/// One interface read becomes exactly one frame; packets are never merged,
/// split or inspected.
pub struct UplinkForwarder<R, W> {
    device: R,
    socket: W,
    buf: Box<[u8]>,
    stats: Arc<SessionStats>,
}

impl<R, W> UplinkForwarder<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a forwarder reading `device` and writing `socket`
    pub fn new(device: R, socket: W, stats: Arc<SessionStats>) -> Self {
        Self {
            device,
            socket,
            buf: vec![0u8; MTU].into_boxed_slice(),
            stats,
        }
    }

    /// Forward packets until `cancel` fires or an I/O error occurs
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        info!("Uplink forwarder started");

        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = self.device.read(&mut self.buf) => read?,
            };

            if n == 0 {
                trace!("Empty interface read, no frame");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(EMPTY_READ_BACKOFF) => continue,
                }
            }

            let frame = encode_u16_length_prefixed(&self.buf[..n])?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                written = write_frame(&mut self.socket, &frame) => written?,
            }

            trace!("Uplink frame: {} bytes", n);
            self.stats.record_uplink(n);
        }

        debug!("Uplink forwarder stopped");
        Ok(())
    }

    /// Give back the interface and socket halves
    pub fn into_inner(self) -> (R, W) {
        (self.device, self.socket)
    }
}

async fn write_frame<W>(socket: &mut W, frame: &[u8]) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    socket.write_all(frame).await?;
    socket.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::frame::{decode_u16_length_prefix, read_exact};
    use crate::tunnel::testing::{BrokenSocket, MockDevice};

    #[tokio::test]
    async fn test_one_frame_per_read_in_order() {
        let (device, _log) = MockDevice::packets(vec![vec![0x45; 100], vec![0x60; 1500]]);
        let (socket, mut peer) = tokio::io::duplex(8192);
        let stats = Arc::new(SessionStats::default());
        let cancel = CancellationToken::new();

        let mut uplink = UplinkForwarder::new(device, socket, Arc::clone(&stats));
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { uplink.run(&task_cancel).await });

        let first = decode_u16_length_prefix(&mut peer).await.unwrap();
        assert_eq!(first, 100);
        assert_eq!(&read_exact(&mut peer, 100).await.unwrap()[..], &[0x45; 100][..]);

        let second = decode_u16_length_prefix(&mut peer).await.unwrap();
        assert_eq!(second, 1500);
        assert_eq!(&read_exact(&mut peer, 1500).await.unwrap()[..], &[0x60; 1500][..]);

        cancel.cancel();
        task.await.unwrap().unwrap();

        let report = stats.snapshot();
        assert_eq!(report.uplink_frames, 2);
        assert_eq!(report.uplink_bytes, 1600);
    }

    #[tokio::test]
    async fn test_empty_read_produces_no_frame() {
        let (device, _log) = MockDevice::packets(vec![vec![], vec![0x45; 20]]);
        let (socket, mut peer) = tokio::io::duplex(1024);
        let stats = Arc::new(SessionStats::default());
        let cancel = CancellationToken::new();

        let mut uplink = UplinkForwarder::new(device, socket, Arc::clone(&stats));
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { uplink.run(&task_cancel).await });

        assert_eq!(decode_u16_length_prefix(&mut peer).await.unwrap(), 20);
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(stats.snapshot().uplink_frames, 1);
    }

    #[tokio::test]
    async fn test_socket_write_failure_is_fatal() {
        let (device, _log) = MockDevice::packets(vec![vec![0x45; 60]]);
        let stats = Arc::new(SessionStats::default());
        let mut uplink = UplinkForwarder::new(device, BrokenSocket, Arc::clone(&stats));

        let err = uplink.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Io(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe));
        assert_eq!(stats.snapshot().uplink_frames, 0);
    }
}
