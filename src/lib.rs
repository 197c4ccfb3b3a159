//! wg-stream: WireGuard over a single TCP/TLS stream
//!
//! This crate lets a WireGuard data-plane run over one long-lived TCP
//! connection, optionally wrapped in browser-mimicking TLS, instead of UDP.
//! It provides the stream bind the device plugs into, the TunSafe framing
//! that maps datagrams onto the byte stream, and a supervisor that keeps
//! the device alive across network changes and socket failures.
//!
//! # Features
//!
//! - **TunSafe framing**: length-prefixed frames with header elision for
//!   in-order data packets, saving 16 bytes per packet on the wire
//! - **TLS camouflage**: rotating Chrome-like ClientHello profiles and
//!   randomized SNI for DPI resistance (the TLS layer is cover traffic;
//!   authentication stays with the WireGuard handshake)
//! - **Connection supervision**: network-availability tracking, handshake
//!   and socket-error observation, exponential-backoff device restarts
//!
//! # Architecture
//!
//! ```text
//! platform connectivity          WireGuard device
//!         |                        |         ^
//!         v                        v send    | recv
//! WireGuardStateManager         StreamBind / PacketReceiver
//!    |        ^                    |
//!    | up/down| socket errors      | TunSafe frames
//!    v        +--------------------+
//! Device                  TCP / TLS stream to the peer
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use wg_stream::bind::{StreamBind, StreamBindConfig};
//! use wg_stream::config::Transmission;
//! use wg_stream::supervisor::WireGuardStateManager;
//!
//! # async fn example(device: Arc<dyn wg_stream::supervisor::Device>) -> wg_stream::Result<()> {
//! let manager = WireGuardStateManager::new(Transmission::Tls);
//! let bind = StreamBind::new(
//!     StreamBindConfig::tls(),
//!     manager.socket_err_sender(),
//!     None,
//! );
//! bind.parse_endpoint("203.0.113.7:443")?;
//! let (_receiver, _port) = bind.open(0).await?;
//!
//! manager.start(device);
//! manager.set_network_available(true);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`tunsafe`]: TunSafe frame codec
//! - [`bind`]: stream transport bind (TCP, TLS)
//! - [`supervisor`]: connection-state supervision
//! - [`config`]: configuration types and loading
//! - [`error`]: error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bind;
pub mod config;
pub mod error;
pub mod supervisor;
pub mod tunsafe;

// Re-export commonly used types at the crate root
pub use bind::{
    create_bind, Bind, BindError, HelloProfile, PacketReceiver, ProtectSocket, StreamBind,
    StreamBindConfig, StreamEndpoint, HELLO_PROFILES,
};
pub use config::{load_config, load_config_str, Config, Transmission};
pub use error::{ConfigError, Result, WgStreamError};
pub use supervisor::{Device, HandshakeState, WireGuardStateManager, WireGuardState};
pub use tunsafe::{
    FrameHeader, TunSafeCodec, UnknownFrameType, TUNSAFE_HEADER_SIZE, TUNSAFE_MAX_PAYLOAD,
    TUNSAFE_TYPE_DATA, TUNSAFE_TYPE_NORMAL, WG_DATA_HEADER_SIZE, WG_DATA_PREFIX_SIZE, WG_DATA_TAG,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
