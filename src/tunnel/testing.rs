//! In-memory stand-ins for the tunnel interface and control socket

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What happened to a [`MockDevice`]
#[derive(Default)]
pub(crate) struct DeviceLog {
    pub reads: AtomicUsize,
    pub writes: Mutex<Vec<Vec<u8>>>,
    pub closed: AtomicBool,
}

impl DeviceLog {
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

/// Tunnel interface that yields scripted reads, then blocks forever
pub(crate) struct MockDevice {
    reads: VecDeque<io::Result<Vec<u8>>>,
    log: Arc<DeviceLog>,
}

impl MockDevice {
    pub fn new(reads: Vec<io::Result<Vec<u8>>>) -> (Self, Arc<DeviceLog>) {
        let log = Arc::new(DeviceLog::default());
        let device = Self {
            reads: reads.into(),
            log: Arc::clone(&log),
        };
        (device, log)
    }

    pub fn packets(packets: Vec<Vec<u8>>) -> (Self, Arc<DeviceLog>) {
        Self::new(packets.into_iter().map(Ok).collect())
    }
}

impl AsyncRead for MockDevice {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.reads.pop_front() {
            Some(Ok(packet)) => {
                self.log.reads.fetch_add(1, Ordering::SeqCst);
                buf.put_slice(&packet);
                Poll::Ready(Ok(()))
            }
            Some(Err(e)) => Poll::Ready(Err(e)),
            None => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.log.writes.lock().unwrap().push(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.log.closed.store(true, Ordering::SeqCst);
    }
}

/// Control socket that never delivers data and fails every write
pub(crate) struct BrokenSocket;

impl AsyncRead for BrokenSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for BrokenSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "peer went away",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
