//! Stream bind lifecycle against real localhost sockets

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use wg_stream::bind::{BindError, StreamBind, StreamBindConfig, StreamEndpoint};

use super::init_tracing;

fn bind_with_errors(config: StreamBindConfig) -> (StreamBind, mpsc::Receiver<BindError>) {
    init_tracing();
    let (error_tx, error_rx) = mpsc::channel(16);
    (StreamBind::new(config, error_tx, None), error_rx)
}

/// An address nothing listens on.
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test]
async fn test_open_does_not_dial() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (bind, _errors) = bind_with_errors(StreamBindConfig::tcp());
    let endpoint = bind
        .parse_endpoint(&listener.local_addr().unwrap().to_string())
        .unwrap();
    let (_receiver, _) = bind.open(0).await.unwrap();

    // No connection shows up until the first send.
    assert!(timeout(Duration::from_millis(100), listener.accept())
        .await
        .is_err());

    bind.send(b"first", endpoint).await.unwrap();
    let accepted = timeout(Duration::from_secs(1), listener.accept()).await;
    assert!(accepted.is_ok());

    bind.close().await.unwrap();
}

#[tokio::test]
async fn test_send_rejects_foreign_endpoint() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (bind, _errors) = bind_with_errors(StreamBindConfig::tcp());
    let bound = bind
        .parse_endpoint(&listener.local_addr().unwrap().to_string())
        .unwrap();
    let (_receiver, _) = bind.open(0).await.unwrap();

    let foreign: StreamEndpoint = "127.0.0.1:9".parse().unwrap();
    let err = bind.send(b"packet", foreign).await.unwrap_err();
    match err {
        BindError::EndpointMismatch { bound: reported } => assert_eq!(reported, bound),
        other => panic!("expected EndpointMismatch, got {other:?}"),
    }

    // The bound endpoint still works on the already-dialed connection.
    bind.send(b"packet", bound).await.unwrap();
    bind.close().await.unwrap();
}

#[tokio::test]
async fn test_dial_failure_is_forwarded_and_latches() {
    let (bind, mut errors) = bind_with_errors(
        StreamBindConfig::tcp().with_connect_timeout(Duration::from_millis(500)),
    );
    let endpoint = bind
        .parse_endpoint(&dead_addr().await.to_string())
        .unwrap();
    let (_receiver, _) = bind.open(0).await.unwrap();

    let err = bind.send(b"packet", endpoint).await.unwrap_err();
    assert!(matches!(err, BindError::DialFailed { .. }), "{err:?}");

    // The failure reaches the supervisor channel.
    let forwarded = timeout(Duration::from_secs(1), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(forwarded, BindError::DialFailed { .. }));

    // The bind is latched closed; Closed is not forwarded.
    let err = bind.send(b"packet", endpoint).await.unwrap_err();
    assert!(err.is_closed());
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_close_unblocks_receiver() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (bind, _errors) = bind_with_errors(StreamBindConfig::tcp());
    let endpoint = bind
        .parse_endpoint(&listener.local_addr().unwrap().to_string())
        .unwrap();
    let (mut receiver, _) = bind.open(0).await.unwrap();

    // Establish the connection, then park the receiver on a quiet stream.
    bind.send(b"wake", endpoint).await.unwrap();
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut discard = vec![0; 64];
    let _ = stream.read(&mut discard).await.unwrap();

    let blocked = tokio::spawn(async move {
        let mut buf = vec![0; 64];
        receiver.recv(&mut buf).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());

    bind.close().await.unwrap();
    let result = timeout(Duration::from_secs(1), blocked)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(BindError::Closed)), "{result:?}");
}

#[tokio::test]
async fn test_protect_hook_failure_fails_dial() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (error_tx, mut errors) = mpsc::channel(16);
    let bind = StreamBind::new(
        StreamBindConfig::tcp(),
        error_tx,
        Some(Arc::new(|_fd| -1)),
    );
    let endpoint = bind
        .parse_endpoint(&listener.local_addr().unwrap().to_string())
        .unwrap();
    let (_receiver, _) = bind.open(0).await.unwrap();

    let err = bind.send(b"packet", endpoint).await.unwrap_err();
    assert!(matches!(err, BindError::ProtectFailed { status: -1 }));
    let forwarded = timeout(Duration::from_secs(1), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(forwarded, BindError::ProtectFailed { .. }));

    // Latched: no redial on the next call.
    assert!(bind.send(b"packet", endpoint).await.unwrap_err().is_closed());
}

#[tokio::test]
async fn test_protect_hook_sees_socket_fd() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seen_fd = Arc::new(AtomicI32::new(-1));
    let recorder = Arc::clone(&seen_fd);
    let (error_tx, _errors) = mpsc::channel(16);
    let bind = StreamBind::new(
        StreamBindConfig::tcp(),
        error_tx,
        Some(Arc::new(move |fd| {
            recorder.store(fd, Ordering::SeqCst);
            0
        })),
    );
    let endpoint = bind
        .parse_endpoint(&listener.local_addr().unwrap().to_string())
        .unwrap();
    let (_receiver, _) = bind.open(0).await.unwrap();

    bind.send(b"packet", endpoint).await.unwrap();
    assert!(seen_fd.load(Ordering::SeqCst) >= 0);
    bind.close().await.unwrap();
}
