//! Error types for the stream bind

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::tunsafe::UnknownFrameType;

use super::endpoint::StreamEndpoint;

/// Errors produced by the stream bind and its receive path.
///
/// The enum is `Clone` so the same error can be returned to the caller and
/// forwarded to the supervisor's error channel; I/O errors are captured as
/// kind plus message for that reason.
#[derive(Debug, Clone, Error)]
pub enum BindError {
    /// `open` called twice without an intervening `close`.
    #[error("bind is already open")]
    AlreadyOpen,

    /// The endpoint string is not a valid `ip:port` pair.
    #[error("invalid endpoint address: {0}")]
    InvalidEndpoint(String),

    /// `send` was called with an endpoint other than the bound one.
    #[error("send endpoint does not match bound endpoint {bound}")]
    EndpointMismatch {
        /// The endpoint this bind is attached to.
        bound: StreamEndpoint,
    },

    /// The stream carried a frame with an unsupported type; fatal.
    #[error(transparent)]
    UnknownFrameType(#[from] UnknownFrameType),

    /// TCP connection could not be established.
    #[error("failed to dial {addr}: {reason}")]
    DialFailed {
        /// Dialed address.
        addr: SocketAddr,
        /// Underlying failure.
        reason: String,
    },

    /// The platform socket-protect hook rejected the socket.
    #[error("socket protect hook failed: status={status}")]
    ProtectFailed {
        /// Status returned by the hook; negative means failure.
        status: i32,
    },

    /// TLS upgrade did not complete.
    #[error("TLS handshake with {server_name} failed: {reason}")]
    TlsHandshakeFailed {
        /// SNI server name offered in the ClientHello.
        server_name: String,
        /// Underlying failure.
        reason: String,
    },

    /// Stream I/O failed.
    #[error("I/O error: {message}")]
    Io {
        /// Kind of the originating `io::Error`.
        kind: io::ErrorKind,
        /// Display form of the originating error.
        message: String,
    },

    /// The bind has been closed.
    #[error("bind is closed")]
    Closed,
}

impl BindError {
    /// Create a dial failure.
    pub fn dial(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::DialFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a TLS handshake failure.
    pub fn tls_handshake(server_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed {
            server_name: server_name.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error reports normal shutdown rather than a fault.
    ///
    /// `Closed` is never forwarded to the supervisor's error channel, so a
    /// deliberate shutdown cannot feed the restart path.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether the peer dropped an established connection.
    ///
    /// The supervisor restarts the device on these; everything else is
    /// observed but not acted on. Classification is by `io::ErrorKind`
    /// rather than message text.
    #[must_use]
    pub fn is_connection_dropped(&self) -> bool {
        matches!(
            self,
            Self::Io {
                kind: io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset,
                ..
            }
        )
    }

    /// Whether retrying the operation can succeed without intervention.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AlreadyOpen
            | Self::InvalidEndpoint(_)
            | Self::EndpointMismatch { .. }
            | Self::UnknownFrameType(_)
            | Self::ProtectFailed { .. }
            | Self::Closed => false,
            Self::DialFailed { .. } | Self::TlsHandshakeFailed { .. } => true,
            Self::Io { kind, .. } => matches!(
                kind,
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

impl From<io::Error> for BindError {
    fn from(e: io::Error) -> Self {
        Self::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
