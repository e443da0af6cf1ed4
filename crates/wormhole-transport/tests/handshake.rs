//! Handshake tests over an in-memory duplex pipe

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wormhole_transport::{ClientCredentials, HandshakeError, ServerKey, TlsClient, TlsHandshake};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn server() -> TlsHandshake {
    let (key, _pem) = ServerKey::generate("localhost").unwrap();
    TlsHandshake::new(&key).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_reports_client_key() {
    init_tracing();
    let handshake = server();
    let credentials = ClientCredentials::generate().unwrap();
    let client = TlsClient::new(Some(&credentials), Some(handshake.fingerprint().to_string())).unwrap();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let (client_result, server_result) = tokio::join!(
        client.connect(client_io, "localhost"),
        handshake.accept(server_io)
    );

    let mut client_stream = client_result.unwrap();
    let (mut server_stream, identity) = server_result.unwrap();
    assert_eq!(identity.fingerprint, credentials.fingerprint());

    client_stream.write_all(b"over tls").await.unwrap();
    client_stream.flush().await.unwrap();

    let mut buf = [0u8; 8];
    server_stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"over tls");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_without_certificate_is_rejected() {
    init_tracing();
    let handshake = server();
    let client = TlsClient::new(None, None).unwrap();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let (_client_result, server_result) = tokio::join!(
        client.connect(client_io, "localhost"),
        handshake.accept(server_io)
    );

    match server_result {
        Err(HandshakeError::AuthenticationFailed(_)) => {}
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("handshake should fail without a client certificate"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_refuses_unpinned_server_key() {
    init_tracing();
    let handshake = server();
    let credentials = ClientCredentials::generate().unwrap();
    let (other_key, _) = ServerKey::generate("localhost").unwrap();
    let client = TlsClient::new(Some(&credentials), Some(other_key.fingerprint().to_string())).unwrap();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let (client_result, server_result) = tokio::join!(
        client.connect(client_io, "localhost"),
        handshake.accept(server_io)
    );

    assert!(client_result.is_err());
    assert!(server_result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_peer_times_out() {
    init_tracing();
    let handshake = server().with_timeout(Duration::from_millis(100));
    let (_client_io, server_io) = tokio::io::duplex(1024);

    let err = handshake.accept(server_io).await.unwrap_err();
    assert!(matches!(err, HandshakeError::Timeout));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_tls_peer_fails_handshake() {
    init_tracing();
    let handshake = server();
    let (mut client_io, server_io) = tokio::io::duplex(1024);

    client_io
        .write_all(b"SSH-2.0-OpenSSH_9.6\r\n")
        .await
        .unwrap();

    let err = handshake.accept(server_io).await.unwrap_err();
    assert!(matches!(err, HandshakeError::Protocol(_)));
}
