//! Session supervisor
//!
//! A session owns the control socket and the tunnel interface. Each is split
//! into halves so that every loop only touches its own direction:
//!
//! ```text
//!   uplink:   interface (read half)  -> socket (write half)
//!   downlink: socket (read half)     -> interface (write half)
//! ```
//!
//! Both loops run as separate tasks under one cancellation token. The first
//! loop to stop, for any reason, cancels the other; both are joined before the
//! socket is shut down and the handles are released.

use super::downlink::{BlobErrorPolicy, DownlinkDispatcher};
use super::manifest::Manifest;
use super::uplink::UplinkForwarder;
use super::TunnelError;
use crate::storage::BlobSource;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Which forwarding loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// Interface -> peer
    Uplink,
    /// Peer -> interface
    Downlink,
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopKind::Uplink => f.write_str("uplink"),
            LoopKind::Downlink => f.write_str("downlink"),
        }
    }
}

/// Why a session ended
#[derive(Debug)]
pub enum Termination {
    /// The caller cancelled the session
    Cancelled,
    /// A loop stopped without an error or a cancellation request
    Finished(LoopKind),
    /// A loop hit a fatal error
    Failed { side: LoopKind, error: TunnelError },
}

/// Traffic counters shared by both loops
#[derive(Debug, Default)]
pub struct SessionStats {
    uplink_frames: AtomicU64,
    uplink_bytes: AtomicU64,
    index_frames: AtomicU64,
    downlink_packets: AtomicU64,
    downlink_bytes: AtomicU64,
    blobs: AtomicU64,
    blobs_failed: AtomicU64,
}

impl SessionStats {
    pub(crate) fn record_uplink(&self, bytes: usize) {
        self.uplink_frames.fetch_add(1, Ordering::Relaxed);
        self.uplink_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_index(&self) {
        self.index_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_downlink(&self, bytes: usize) {
        self.downlink_packets.fetch_add(1, Ordering::Relaxed);
        self.downlink_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_blob(&self) {
        self.blobs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_blob_failure(&self) {
        self.blobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> SessionReport {
        SessionReport {
            uplink_frames: self.uplink_frames.load(Ordering::Relaxed),
            uplink_bytes: self.uplink_bytes.load(Ordering::Relaxed),
            index_frames: self.index_frames.load(Ordering::Relaxed),
            downlink_packets: self.downlink_packets.load(Ordering::Relaxed),
            downlink_bytes: self.downlink_bytes.load(Ordering::Relaxed),
            blobs: self.blobs.load(Ordering::Relaxed),
            blobs_failed: self.blobs_failed.load(Ordering::Relaxed),
            termination: None,
        }
    }
}

/// Counters and outcome of a finished session.
///
/// `blobs`/`blobs_failed` count fetched/skipped blobs on the client and
/// stored/dropped batches on the relay.
#[derive(Debug)]
pub struct SessionReport {
    pub uplink_frames: u64,
    pub uplink_bytes: u64,
    pub index_frames: u64,
    pub downlink_packets: u64,
    pub downlink_bytes: u64,
    pub blobs: u64,
    pub blobs_failed: u64,
    /// Set once the session has ended
    pub termination: Option<Termination>,
}

impl SessionReport {
    /// The fatal error that ended the session, if any
    pub fn error(&self) -> Option<&TunnelError> {
        match &self.termination {
            Some(Termination::Failed { error, .. }) => Some(error),
            _ => None,
        }
    }

    /// Turn a failed session into its error
    pub fn into_result(self) -> Result<Self, TunnelError> {
        match self.termination {
            Some(Termination::Failed { error, .. }) => Err(error),
            termination => Ok(Self {
                termination,
                ..self
            }),
        }
    }
}

/// Client side of a tunnel session
pub struct Session {
    manifest: Manifest,
    source: Arc<dyn BlobSource>,
    policy: BlobErrorPolicy,
}

impl Session {
    /// Create a session for a completed handshake
    pub fn new(manifest: Manifest, source: Arc<dyn BlobSource>) -> Self {
        Self {
            manifest,
            source,
            policy: BlobErrorPolicy::default(),
        }
    }

    /// Set how unfetchable or malformed blobs are handled
    pub fn with_blob_error_policy(mut self, policy: BlobErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run both loops until one fails or `cancel` fires, then tear down
    pub async fn run<S, D>(self, socket: S, device: D, cancel: CancellationToken) -> SessionReport
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let stats = Arc::new(SessionStats::default());
        let (socket_rx, socket_tx) = tokio::io::split(socket);
        let (device_rx, device_tx) = tokio::io::split(device);

        let mut uplink = UplinkForwarder::new(device_rx, socket_tx, Arc::clone(&stats));
        let mut downlink = DownlinkDispatcher::new(
            socket_rx,
            device_tx,
            self.manifest,
            self.source,
            self.policy,
            Arc::clone(&stats),
        );

        let token = cancel.child_token();
        let uplink_token = token.clone();
        let downlink_token = token.clone();

        let (termination, uplink, downlink) = supervise(
            async move {
                let result = uplink.run(&uplink_token).await;
                (result, uplink)
            },
            async move {
                let result = downlink.run(&downlink_token).await;
                (result, downlink)
            },
            &cancel,
            &token,
        )
        .await;

        // Close the socket once; the interface closes when its halves drop
        drop(downlink);
        if let Some(uplink) = uplink {
            let (_device_rx, mut socket_tx) = uplink.into_inner();
            if let Err(e) = socket_tx.shutdown().await {
                debug!("Control socket shutdown: {}", e);
            }
        }

        finish_report(&stats, termination)
    }
}

/// Log the outcome and attach it to the counters
pub(crate) fn finish_report(stats: &SessionStats, termination: Termination) -> SessionReport {
    let mut report = stats.snapshot();
    match &termination {
        Termination::Cancelled => info!("Session cancelled"),
        Termination::Finished(side) => info!("Session ended: {} loop finished", side),
        Termination::Failed { side, error } => error!("Session failed in {} loop: {}", side, error),
    }
    info!(
        "Session totals: uplink {} frames / {} bytes, downlink {} indices / {} packets / {} bytes, blobs {} ok / {} failed",
        report.uplink_frames,
        report.uplink_bytes,
        report.index_frames,
        report.downlink_packets,
        report.downlink_bytes,
        report.blobs,
        report.blobs_failed
    );
    report.termination = Some(termination);
    report
}

type LoopOutput<T> = (Result<(), TunnelError>, T);

/// Run two loops as tasks; the first to stop cancels `token` and both are
/// joined. Returns why the session ended and whatever each loop handed back.
pub(crate) async fn supervise<U, D, UT, DT>(
    uplink: U,
    downlink: D,
    cancel: &CancellationToken,
    token: &CancellationToken,
) -> (Termination, Option<UT>, Option<DT>)
where
    U: Future<Output = LoopOutput<UT>> + Send + 'static,
    D: Future<Output = LoopOutput<DT>> + Send + 'static,
    UT: Send + 'static,
    DT: Send + 'static,
{
    let mut uplink_task = tokio::spawn(uplink);
    let mut downlink_task = tokio::spawn(downlink);

    let mut uplink_joined = None;
    let mut downlink_joined = None;
    tokio::select! {
        joined = &mut uplink_task => uplink_joined = Some(joined),
        joined = &mut downlink_task => downlink_joined = Some(joined),
    }
    let first = if uplink_joined.is_some() {
        LoopKind::Uplink
    } else {
        LoopKind::Downlink
    };

    token.cancel();

    let uplink_joined = match uplink_joined {
        Some(joined) => joined,
        None => uplink_task.await,
    };
    let downlink_joined = match downlink_joined {
        Some(joined) => joined,
        None => downlink_task.await,
    };

    let (uplink_result, uplink_out) = unpack(uplink_joined);
    let (downlink_result, downlink_out) = unpack(downlink_joined);

    let (first_result, second_result) = match first {
        LoopKind::Uplink => (uplink_result, downlink_result),
        LoopKind::Downlink => (downlink_result, uplink_result),
    };

    if let Err(e) = second_result {
        debug!("Peer loop also stopped with: {}", e);
    }

    let termination = match first_result {
        Err(error) => Termination::Failed { side: first, error },
        Ok(()) if cancel.is_cancelled() => Termination::Cancelled,
        Ok(()) => Termination::Finished(first),
    };

    (termination, uplink_out, downlink_out)
}

fn unpack<T>(joined: Result<LoopOutput<T>, JoinError>) -> (Result<(), TunnelError>, Option<T>) {
    match joined {
        Ok((result, out)) => (result, Some(out)),
        Err(e) => (Err(TunnelError::Join(e.to_string())), None),
    }
}
