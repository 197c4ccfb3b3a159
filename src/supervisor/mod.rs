//! Connection-state supervision
//!
//! The supervisor watches what happens around the tunnel (network
//! availability, WireGuard handshake outcomes, socket errors from the
//! stream bind) and decides when the device goes up, goes down, or gets
//! restarted. Restarts back off exponentially so a flapping link cannot
//! thrash the device.
//!
//! Hosts feed [`WireGuardStateManager::set_network_available`] from their
//! platform's connectivity broadcasts and poll
//! [`WireGuardStateManager::get_state`] in a loop for UI updates; the bind
//! and device post to the supervisor's handshake and error channels.

mod device;
mod manager;
mod state;

pub use device::Device;
pub use manager::WireGuardStateManager;
pub use state::{HandshakeState, WireGuardState};
