//! Stream transport bind for the WireGuard device
//!
//! A bind is the socket abstraction a WireGuard device sends and receives
//! datagrams through. This module provides the stream flavor: one
//! long-lived TCP connection to a single endpoint, optionally wrapped in
//! TLS with a browser-mimicking ClientHello, carrying datagrams in TunSafe
//! frames.
//!
//! # Architecture
//!
//! ```text
//! WireGuard device
//!    |  send(datagram)              recv(buf)
//!    v                                 ^
//! StreamBind ----------------- PacketReceiver
//!    |        TunSafe codec           |
//!    +------ TCP / TLS stream --------+
//!                  |
//!                  v  errors (except Closed)
//!        supervisor error channel
//! ```
//!
//! The bind knows nothing about the supervisor beyond the sending end of
//! its error channel, keeping ownership one-way.
//!
//! UDP transmission is out of scope here: it needs no framing or
//! supervision and is served by the platform's datagram bind.

mod endpoint;
mod error;
mod stream;
mod tls;

pub use endpoint::StreamEndpoint;
pub use error::BindError;
pub use stream::{PacketReceiver, ProtectSocket, StreamBind, StreamBindConfig};
pub use tls::{HelloProfile, HELLO_PROFILES};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::Transmission;

/// Build the bind for the given transmission.
///
/// Returns `None` for UDP: datagrams need no framing or supervision and
/// are served by the platform's own bind.
#[must_use]
pub fn create_bind(
    transmission: Transmission,
    error_tx: mpsc::Sender<BindError>,
    protect: Option<ProtectSocket>,
) -> Option<StreamBind> {
    let config = match transmission {
        Transmission::Udp => return None,
        Transmission::Tcp => StreamBindConfig::tcp(),
        Transmission::Tls => StreamBindConfig::tls(),
    };
    Some(StreamBind::new(config, error_tx, protect))
}

/// The bind contract the WireGuard device consumes.
#[async_trait]
pub trait Bind: Send + Sync {
    /// Parse `ip:port` and record it as the bound endpoint.
    fn parse_endpoint(&self, s: &str) -> Result<StreamEndpoint, BindError>;

    /// Mark the bind open and return the receive half plus the local port.
    async fn open(&self, port: u16) -> Result<(PacketReceiver, u16), BindError>;

    /// Send one WireGuard datagram to the bound endpoint.
    async fn send(&self, datagram: &[u8], endpoint: StreamEndpoint) -> Result<(), BindError>;

    /// Tear the connection down and make the bind return `Closed`.
    async fn close(&self) -> Result<(), BindError>;

    /// Apply a routing mark to the socket, where that is meaningful.
    fn set_mark(&self, mark: u32) -> Result<(), BindError>;
}

#[async_trait]
impl Bind for StreamBind {
    fn parse_endpoint(&self, s: &str) -> Result<StreamEndpoint, BindError> {
        StreamBind::parse_endpoint(self, s)
    }

    async fn open(&self, port: u16) -> Result<(PacketReceiver, u16), BindError> {
        StreamBind::open(self, port).await
    }

    async fn send(&self, datagram: &[u8], endpoint: StreamEndpoint) -> Result<(), BindError> {
        StreamBind::send(self, datagram, endpoint).await
    }

    async fn close(&self) -> Result<(), BindError> {
        StreamBind::close(self).await
    }

    fn set_mark(&self, mark: u32) -> Result<(), BindError> {
        StreamBind::set_mark(self, mark)
    }
}
