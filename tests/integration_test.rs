//! Integration tests for Blob Tunnel
//!
//! Tests the full client-relay flow over loopback TCP:
//! - Manifest handshake
//! - Uplink frames reaching the relay's interface
//! - Relay batches travelling through the blob store back to the client
//! - Session teardown on cancellation, hang-up and protocol violations

use blob_tunnel::protocol::ProtocolError;
use blob_tunnel::relay::{BatchLimits, RelaySession};
use blob_tunnel::storage::{DirBlobStore, MemoryBlobStore};
use blob_tunnel::transport::{TransportConfig, TunnelConnection};
use blob_tunnel::tunnel::{
    encode_blob, write_manifest, Frame, LoopKind, Manifest, Termination, TunnelError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn transport_config() -> TransportConfig {
    TransportConfig {
        connect_timeout: 5,
        handshake_timeout: 5,
        ..TransportConfig::default()
    }
}

/// Read exactly `len` bytes the tunnel wrote to its interface
async fn read_packet(kernel: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(TEST_TIMEOUT, kernel.read_exact(&mut buf))
        .await
        .expect("timed out waiting for packet")
        .unwrap();
    buf
}

/// Full round trip: client -> relay over the socket, relay -> client via blobs
#[tokio::test]
async fn test_client_relay_round_trip() {
    let store = Arc::new(MemoryBlobStore::new());
    let relay = RelaySession::new(
        Manifest::new(["slot-0", "slot-1", "slot-2"]),
        store.clone(),
        BatchLimits {
            window: Duration::from_millis(20),
            max_packets: 32,
        },
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (relay_device, mut relay_kernel) = tokio::io::duplex(16 * 1024);
    let relay_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        relay
            .serve(socket, relay_device, CancellationToken::new())
            .await
            .unwrap()
    });

    let (client_device, mut client_kernel) = tokio::io::duplex(16 * 1024);
    let connection = TunnelConnection::connect(
        "127.0.0.1",
        port,
        client_device,
        store.clone(),
        &transport_config(),
    )
    .await
    .unwrap();
    assert_eq!(connection.manifest().len(), 3);

    let cancel = CancellationToken::new();
    let client_task = tokio::spawn(connection.run(cancel.clone()));

    // Uplink: client interface -> control socket -> relay interface
    let uplink_packet = vec![0x45; 120];
    client_kernel.write_all(&uplink_packet).await.unwrap();
    assert_eq!(read_packet(&mut relay_kernel, 120).await, uplink_packet);

    // Downlink: relay interface -> blob slot -> index frame -> client interface
    let downlink_packet = vec![0x60; 300];
    relay_kernel.write_all(&downlink_packet).await.unwrap();
    assert_eq!(read_packet(&mut client_kernel, 300).await, downlink_packet);
    assert!(store.get("slot-0").is_some());

    cancel.cancel();
    let client_report = tokio::time::timeout(TEST_TIMEOUT, client_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        client_report.termination,
        Some(Termination::Cancelled)
    ));
    assert_eq!(client_report.uplink_frames, 1);
    assert_eq!(client_report.uplink_bytes, 120);
    assert_eq!(client_report.index_frames, 1);
    assert_eq!(client_report.blobs, 1);

    // The client closed the socket, so the relay sees a hang-up
    let relay_report = tokio::time::timeout(TEST_TIMEOUT, relay_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        relay_report.termination,
        Some(Termination::Failed {
            side: LoopKind::Uplink,
            error: TunnelError::ConnectionClosed
        })
    ));
    assert_eq!(relay_report.uplink_frames, 1);
    assert_eq!(relay_report.blobs, 1);
}

/// Relay writing to a directory, client reading the same directory
#[tokio::test]
async fn test_round_trip_through_blob_directory() {
    let dir = tempfile::tempdir().unwrap();
    let relay = RelaySession::new(
        Manifest::new(["a", "b"]),
        Arc::new(DirBlobStore::new(dir.path())),
        BatchLimits {
            window: Duration::from_millis(10),
            max_packets: 8,
        },
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (relay_device, mut relay_kernel) = tokio::io::duplex(8192);
    let relay_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        relay
            .serve(socket, relay_device, CancellationToken::new())
            .await
            .unwrap()
    });

    let (client_device, mut client_kernel) = tokio::io::duplex(8192);
    let connection = TunnelConnection::connect(
        "127.0.0.1",
        port,
        client_device,
        Arc::new(DirBlobStore::new(dir.path())),
        &transport_config(),
    )
    .await
    .unwrap();
    let cancel = CancellationToken::new();
    let client_task = tokio::spawn(connection.run(cancel.clone()));

    for (i, len) in [64usize, 1500, 1].into_iter().enumerate() {
        let packet = vec![i as u8 + 1; len];
        relay_kernel.write_all(&packet).await.unwrap();
        assert_eq!(read_packet(&mut client_kernel, len).await, packet);
    }

    cancel.cancel();
    let report = client_task.await.unwrap();
    assert!(report.error().is_none());
    assert_eq!(report.downlink_packets, 3);

    relay_task.await.unwrap();
}

/// An index past the end of the manifest ends the session with a protocol error
#[tokio::test]
async fn test_out_of_range_index_ends_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // Trailing newline does not add an entry
        let text = b"only\n";
        socket
            .write_all(&(text.len() as u32).to_be_bytes())
            .await
            .unwrap();
        socket.write_all(text).await.unwrap();
        socket
            .write_all(&Frame::Index(5).encode().unwrap())
            .await
            .unwrap();

        // Wait for the client to hang up
        let mut buf = [0u8; 64];
        while socket.read(&mut buf).await.unwrap_or(0) > 0 {}
    });

    let (client_device, _client_kernel) = tokio::io::duplex(1024);
    let connection = TunnelConnection::connect(
        "127.0.0.1",
        port,
        client_device,
        Arc::new(MemoryBlobStore::new()),
        &transport_config(),
    )
    .await
    .unwrap();
    assert_eq!(connection.manifest(), &Manifest::new(["only"]));

    let report = tokio::time::timeout(TEST_TIMEOUT, connection.run(CancellationToken::new()))
        .await
        .expect("session did not terminate");
    assert!(matches!(
        report.termination,
        Some(Termination::Failed {
            side: LoopKind::Downlink,
            error: TunnelError::Protocol(ProtocolError::IndexOutOfRange { index: 5, len: 1 })
        })
    ));

    tokio::time::timeout(TEST_TIMEOUT, peer)
        .await
        .expect("socket was not closed")
        .unwrap();
}

/// A missing blob is skipped and later indices still deliver packets
#[tokio::test]
async fn test_missing_blob_is_skipped() {
    let store = Arc::new(MemoryBlobStore::new());
    store.insert("present", encode_blob([vec![0x11; 40]]).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        write_manifest(&mut socket, &Manifest::new(["missing", "present"]))
            .await
            .unwrap();
        socket.write_all(&[0x00, 0x00, 0x00, 0x01]).await.unwrap();
        socket
    });

    let (client_device, mut client_kernel) = tokio::io::duplex(1024);
    let connection = TunnelConnection::connect(
        "127.0.0.1",
        port,
        client_device,
        store,
        &transport_config(),
    )
    .await
    .unwrap();
    let cancel = CancellationToken::new();
    let client_task = tokio::spawn(connection.run(cancel.clone()));

    assert_eq!(read_packet(&mut client_kernel, 40).await, vec![0x11; 40]);

    cancel.cancel();
    let report = client_task.await.unwrap();
    assert_eq!(report.blobs, 1);
    assert_eq!(report.blobs_failed, 1);
    drop(peer.await.unwrap());
}

/// Connecting to a port nobody listens on fails before any forwarding
#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (client_device, _client_kernel) = tokio::io::duplex(64);
    let result = TunnelConnection::connect(
        "127.0.0.1",
        port,
        client_device,
        Arc::new(MemoryBlobStore::new()),
        &transport_config(),
    )
    .await;
    assert!(matches!(result, Err(blob_tunnel::Error::Transport(_))));
}
