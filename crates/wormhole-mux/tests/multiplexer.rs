//! Multiplexer behaviour over an in-memory duplex pipe

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use wormhole_mux::{MuxConfig, Multiplexer, Role};
use wormhole_proto::{Frame, FrameCodec, FrameType};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn pair() -> (Multiplexer, Multiplexer) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    (Multiplexer::client(client_io), Multiplexer::server(server_io))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_open_accept_and_echo() {
    init_tracing();
    let (client, server) = pair();

    let mut outgoing = client.open_stream().await.unwrap();
    assert_eq!(outgoing.stream_id(), 1);

    outgoing.write_all(b"hello").await.unwrap();

    let mut incoming = timeout(Duration::from_secs(5), server.accept_stream())
        .await
        .unwrap()
        .expect("stream accepted");
    assert_eq!(incoming.stream_id(), 1);

    let mut buf = [0u8; 5];
    incoming.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    incoming.write_all(b"world").await.unwrap();
    outgoing.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_opened_streams_use_even_ids() {
    init_tracing();
    let (client, server) = pair();

    let first = server.open_stream().await.unwrap();
    let second = server.open_stream().await.unwrap();
    assert_eq!(first.stream_id(), 2);
    assert_eq!(second.stream_id(), 4);

    let accepted = client.accept_stream().await.unwrap();
    assert_eq!(accepted.stream_id(), 2);
    assert_eq!(server.role(), Role::Server);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_streams_are_independent() {
    init_tracing();
    let (client, server) = pair();

    let mut a = server.open_stream().await.unwrap();
    let mut b = server.open_stream().await.unwrap();
    let mut peer_a = client.accept_stream().await.unwrap();
    let mut peer_b = client.accept_stream().await.unwrap();

    b.write_all(b"bbbb").await.unwrap();
    a.write_all(b"aaaa").await.unwrap();

    let mut buf = [0u8; 4];
    peer_a.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"aaaa");
    peer_b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"bbbb");

    // Closing one stream leaves the other usable
    drop(a);
    let mut rest = Vec::new();
    peer_a.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    b.write_all(b"more").await.unwrap();
    peer_b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"more");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_half_close_keeps_read_side_open() {
    init_tracing();
    let (client, server) = pair();

    let mut local = server.open_stream().await.unwrap();
    let mut remote = client.accept_stream().await.unwrap();

    local.write_all(b"request").await.unwrap();
    local.shutdown().await.unwrap();

    let mut request = Vec::new();
    remote.read_to_end(&mut request).await.unwrap();
    assert_eq!(request, b"request");

    remote.write_all(b"response").await.unwrap();
    remote.shutdown().await.unwrap();

    let mut response = Vec::new();
    local.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"response");

    let err = local.write_all(b"late").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BrokenPipe);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_write_is_split_into_frames() {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(8 * 1024);
    let config = MuxConfig {
        max_frame_payload: 1024,
        ..Default::default()
    };
    let client = Multiplexer::new(client_io, Role::Client, config.clone());
    let server = Multiplexer::new(server_io, Role::Server, config);

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let mut writer = client.open_stream().await.unwrap();
    let expected = payload.clone();
    let send = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();
        writer
    });

    let mut reader = server.accept_stream().await.unwrap();
    let mut received = Vec::new();
    timeout(Duration::from_secs(10), reader.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received, expected);
    drop(send.await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_resets_peer() {
    init_tracing();
    let (client, server) = pair();

    let local = server.open_stream().await.unwrap();
    let mut remote = client.accept_stream().await.unwrap();

    local.abort();

    let mut buf = [0u8; 1];
    let err = remote.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionReset);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_unblocks_pending_reads() {
    init_tracing();
    let (client, server) = pair();

    let mut local = server.open_stream().await.unwrap();
    let _remote = client.accept_stream().await.unwrap();

    let blocked = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        local.read(&mut buf).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.close().await;

    let result = timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::ConnectionAborted);

    assert!(server.is_closed());
    assert_eq!(server.active_streams(), 0);
    assert!(server.open_stream().await.is_err());
    assert!(server.accept_stream().await.is_none());

    // Idempotent
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_close_is_observed() {
    init_tracing();
    let (client, server) = pair();

    let mut stream = client.open_stream().await.unwrap();
    let _accepted = server.accept_stream().await.unwrap();

    server.close().await;

    timeout(Duration::from_secs(5), client.closed())
        .await
        .expect("client notices transport shutdown");

    let mut buf = [0u8; 1];
    let err = stream.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionAborted);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropping_stream_releases_slot() {
    init_tracing();
    let (client, server) = pair();

    let stream = client.open_stream().await.unwrap();
    let accepted = server.accept_stream().await.unwrap();
    assert_eq!(client.active_streams(), 1);

    drop(stream);
    assert_eq!(client.active_streams(), 0);

    drop(accepted);
    assert_eq!(server.active_streams(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_writes_stall_until_peer_reads() {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(1024);
    let config = MuxConfig {
        max_receive_buffer: 64 * 1024,
        ..Default::default()
    };
    let client = Multiplexer::new(client_io, Role::Client, config.clone());
    let server = Multiplexer::new(server_io, Role::Server, config);

    let mut writer = server.open_stream().await.unwrap();
    let mut reader = client.accept_stream().await.unwrap();

    // Nobody reads: the writer gets one window through and then waits
    let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 253) as u8).collect();
    let expected = payload.clone();
    let mut send = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();
        writer
    });

    let stalled = timeout(Duration::from_millis(500), &mut send).await;
    assert!(stalled.is_err(), "1 MiB written into a 64 KiB window nobody reads");

    // Reading hands credit back and the rest flows
    let mut received = Vec::new();
    timeout(Duration::from_secs(10), reader.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, expected);
    drop(send.await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_overrunning_window_is_reset() {
    init_tracing();
    let (raw_io, server_io) = tokio::io::duplex(64 * 1024);
    let config = MuxConfig {
        max_frame_payload: 4096,
        max_receive_buffer: 1024,
        ..Default::default()
    };
    let server = Multiplexer::new(server_io, Role::Server, config);

    // Hand-driven client that ignores the credit it was given
    let (raw_read, raw_write) = tokio::io::split(raw_io);
    let mut frames_out = FramedWrite::new(raw_write, FrameCodec::new());
    let mut frames_in = FramedRead::new(raw_read, FrameCodec::new());

    frames_out.send(Frame::open(1)).await.unwrap();
    frames_out
        .send(Frame::data(1, Bytes::from(vec![7u8; 1000])))
        .await
        .unwrap();
    frames_out
        .send(Frame::data(1, Bytes::from(vec![8u8; 1000])))
        .await
        .unwrap();

    let grant = frames_in.next().await.unwrap().unwrap();
    assert_eq!(grant.frame_type, FrameType::WindowUpdate);
    assert_eq!(grant.window_increment(), Some(1024));

    let reset = timeout(Duration::from_secs(5), frames_in.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reset.stream_id, 1);
    assert!(reset.is_reset());

    // Data inside the window is still delivered, then the reset surfaces
    let mut stream = server.accept_stream().await.unwrap();
    let mut buf = [0u8; 1000];
    stream.read_exact(&mut buf).await.unwrap();
    assert!(buf.iter().all(|&b| b == 7));
    let err = stream.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionReset);
    assert_eq!(server.active_streams(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reset_fails_blocked_writer() {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let config = MuxConfig {
        max_receive_buffer: 1024,
        ..Default::default()
    };
    let client = Multiplexer::new(client_io, Role::Client, config.clone());
    let server = Multiplexer::new(server_io, Role::Server, config);

    let mut writer = server.open_stream().await.unwrap();
    let reader = client.accept_stream().await.unwrap();

    let blocked = tokio::spawn(async move { writer.write_all(&[1u8; 8192]).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    reader.abort();

    let err = timeout(Duration::from_secs(5), blocked)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionReset);
}
