//! Integration tests: raw wire sessions against a bound server.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use extidx_core::FailurePoints;
use extidx_core::failure_point::SERVER_BUILD;
use extidx_core::graph::validate_index;
use extidx_core::protocol::{
    ClientFrame, ERR_MSG, FrameCodec, INDEX_HEADER_LEN, IndexHeader, IndexMetadata, MetricKind,
    PREAMBLE_LEN, PeerRole, Preamble, VectorRecord, decode_error_message,
};
use extidx_daemon::{IndexServer, ServerConfig, ServerStatus, StatusTracker};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Encoder;

// =============================================================================
// Helpers
// =============================================================================

async fn start(points: Arc<FailurePoints>) -> (std::net::SocketAddr, Arc<StatusTracker>) {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
        .with_socket_timeout(Duration::from_secs(5))
        .with_failure_points(points);
    let server = IndexServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let status = server.status();
    tokio::spawn(server.run());
    (addr, status)
}

fn session_bytes(n: u64) -> BytesMut {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    let metadata = IndexMetadata::new(3, MetricKind::Cos).with_row_count(n);
    codec
        .encode(ClientFrame::Preamble(Preamble::local(PeerRole::Client)), &mut buf)
        .unwrap();
    codec.encode(ClientFrame::Metadata(metadata), &mut buf).unwrap();
    for i in 0..n {
        let x = i as f32;
        let record = VectorRecord::f32(i + 100, vec![x.sin(), x.cos(), 1.0]);
        codec.encode(ClientFrame::Vector(record), &mut buf).unwrap();
    }
    codec.encode(ClientFrame::End, &mut buf).unwrap();
    buf
}

async fn wait_for_idle(status: &StatusTracker) {
    for _ in 0..100 {
        if status.snapshot().active_sessions == 0 && status.status() != ServerStatus::InProgress {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("sessions still active");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_session_over_tcp() {
    let (addr, status) = start(Arc::new(FailurePoints::new())).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&session_bytes(200)).await.unwrap();

    let mut preamble = [0u8; PREAMBLE_LEN];
    stream.read_exact(&mut preamble).await.unwrap();
    assert_eq!(
        Preamble::decode(&preamble).unwrap().role,
        PeerRole::IndexingServer
    );

    let mut header = [0u8; INDEX_HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let header = IndexHeader::decode(&header).unwrap();
    let mut body = vec![0u8; usize::try_from(header.body_size).unwrap()];
    stream.read_exact(&mut body).await.unwrap();
    header.verify_body(&body).unwrap();

    let report = validate_index(&body).unwrap();
    assert_eq!(report.num_vectors, 200);
    assert_eq!(report.metric, MetricKind::Cos);

    wait_for_idle(&status).await;
    let snapshot = status.snapshot();
    assert_eq!(snapshot.completed_sessions, 1);
    assert_eq!(snapshot.status, ServerStatus::Succeeded as u8);
}

#[tokio::test]
async fn test_concurrent_sessions_are_independent() {
    let (addr, status) = start(Arc::new(FailurePoints::new())).await;

    let tasks = (1..=4u64).map(|k| {
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&session_bytes(k * 25)).await.unwrap();
            let mut preamble = [0u8; PREAMBLE_LEN];
            stream.read_exact(&mut preamble).await.unwrap();
            let mut header = [0u8; INDEX_HEADER_LEN];
            stream.read_exact(&mut header).await.unwrap();
            let header = IndexHeader::decode(&header).unwrap();
            let mut body = vec![0u8; usize::try_from(header.body_size).unwrap()];
            stream.read_exact(&mut body).await.unwrap();
            header.verify_body(&body).unwrap();
            header.num_vectors
        })
    });
    let mut counts = Vec::new();
    for task in tasks {
        counts.push(task.await.unwrap());
    }
    assert_eq!(counts, vec![25, 50, 75, 100]);

    wait_for_idle(&status).await;
    assert_eq!(status.snapshot().completed_sessions, 4);
}

#[tokio::test]
async fn test_build_failure_then_recovery() {
    let points = Arc::new(FailurePoints::new());
    let (addr, status) = start(Arc::clone(&points)).await;
    points
        .enable(SERVER_BUILD.func, SERVER_BUILD.name, 0)
        .unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&session_bytes(10)).await.unwrap();
    let mut preamble = [0u8; PREAMBLE_LEN];
    stream.read_exact(&mut preamble).await.unwrap();

    let mut head = [0u8; 8];
    stream.read_exact(&mut head).await.unwrap();
    let mut head = &head[..];
    assert_eq!(head.get_u32_le(), ERR_MSG);
    let mut message = vec![0u8; head.get_u32_le() as usize];
    stream.read_exact(&mut message).await.unwrap();
    assert_eq!(decode_error_message(&message), "index build failed");

    wait_for_idle(&status).await;
    assert_eq!(status.status(), ServerStatus::Failed);

    // The point disarmed itself
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&session_bytes(10)).await.unwrap();
    let mut reply = [0u8; PREAMBLE_LEN + INDEX_HEADER_LEN];
    stream.read_exact(&mut reply).await.unwrap();
    let header = IndexHeader::decode(&reply[PREAMBLE_LEN..]).unwrap();
    assert_eq!(header.num_vectors, 10);
}

#[tokio::test]
async fn test_garbage_preamble() {
    let (addr, status) = start(Arc::new(FailurePoints::new())).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let mut head = [0u8; 8];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(u32::from_le_bytes([head[0], head[1], head[2], head[3]]), ERR_MSG);

    wait_for_idle(&status).await;
    assert_eq!(status.snapshot().failed_sessions, 1);
}
