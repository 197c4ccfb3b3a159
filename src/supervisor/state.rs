//! Published connection states and handshake events

use std::fmt;

/// Coarse tunnel state published to the host.
///
/// This is the only user-visible surface of the supervisor; downstream UIs
/// map these to user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireGuardState {
    /// Supervisor not running, or closed.
    Disabled,
    /// Device is being brought up or restarted.
    Connecting,
    /// A WireGuard handshake completed.
    Connected,
    /// A handshake failed or the device could not transition.
    Error,
    /// No network; the device stays down until it returns.
    WaitingForNetwork,
}

impl fmt::Display for WireGuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::WaitingForNetwork => "waiting-for-network",
        };
        f.write_str(s)
    }
}

/// WireGuard handshake lifecycle event, posted by the device glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Handshake initiation sent.
    Init,
    /// Handshake completed.
    Success,
    /// Handshake gave up.
    Fail,
}
