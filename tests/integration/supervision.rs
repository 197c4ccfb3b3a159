//! Bind and supervisor wired together

use std::io;
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout};

use wg_stream::bind::{StreamBind, StreamBindConfig};
use wg_stream::config::Transmission;
use wg_stream::supervisor::{Device, WireGuardState, WireGuardStateManager};

use super::init_tracing;

#[derive(Default)]
struct CountingDevice {
    up_count: AtomicU32,
    down_count: AtomicU32,
}

#[async_trait]
impl Device for CountingDevice {
    async fn up(&self) -> io::Result<()> {
        self.up_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn down(&self) -> io::Result<()> {
        self.down_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_dial_failure_is_observed_without_restart() {
    init_tracing();
    let manager = WireGuardStateManager::new(Transmission::Tcp);
    let device = Arc::new(CountingDevice::default());
    manager.start(Arc::clone(&device) as Arc<dyn Device>);

    let bind = StreamBind::new(
        StreamBindConfig::tcp().with_connect_timeout(Duration::from_millis(300)),
        manager.socket_err_sender(),
        None,
    );
    // Nothing listens here.
    let free_port = {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let endpoint = bind.parse_endpoint(&free_port.to_string()).unwrap();
    let (_receiver, _) = bind.open(0).await.unwrap();

    manager.set_network_available(true);
    assert_eq!(
        timeout(Duration::from_secs(1), manager.get_state())
            .await
            .unwrap(),
        WireGuardState::Connecting
    );

    // A dial failure is not a dropped connection, so the supervisor only
    // observes it.
    assert!(bind.send(b"packet", endpoint).await.is_err());
    sleep(Duration::from_millis(200)).await;
    assert_eq!(device.up_count.load(Ordering::SeqCst), 1);
    assert_eq!(device.down_count.load(Ordering::SeqCst), 0);

    manager.close();
}

#[tokio::test]
async fn test_bind_close_does_not_feed_restart_path() {
    init_tracing();
    let manager = WireGuardStateManager::new(Transmission::Tcp);
    let device = Arc::new(CountingDevice::default());
    manager.start(Arc::clone(&device) as Arc<dyn Device>);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bind = StreamBind::new(StreamBindConfig::tcp(), manager.socket_err_sender(), None);
    let endpoint = bind
        .parse_endpoint(&listener.local_addr().unwrap().to_string())
        .unwrap();
    let (mut receiver, _) = bind.open(0).await.unwrap();

    manager.set_network_available(true);
    bind.send(b"wake", endpoint).await.unwrap();
    let _conn = listener.accept().await.unwrap();

    let blocked = tokio::spawn(async move {
        let mut buf = vec![0; 64];
        receiver.recv(&mut buf).await
    });
    sleep(Duration::from_millis(50)).await;
    bind.close().await.unwrap();
    let result = timeout(Duration::from_secs(1), blocked)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_err());

    // Closing the bind produced no device churn: still the single bring-up
    // from the network appearing.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(device.up_count.load(Ordering::SeqCst), 1);
    assert_eq!(device.down_count.load(Ordering::SeqCst), 0);

    manager.close();
}
