//! WireGuard state manager
//!
//! One event-loop task owns every device transition. Events arrive on
//! buffered channels; the published state lives in a single-slot watch
//! channel, so publishing never blocks and a reader always observes the
//! current state rather than a history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::bind::BindError;
use crate::config::Transmission;

use super::device::Device;
use super::state::{HandshakeState, WireGuardState};

/// Delay before the first restart is allowed again.
const INITIAL_RESTART_DELAY: Duration = Duration::from_secs(4);

/// Ceiling for the exponentially growing restart delay.
const MAX_RESTART_DELAY: Duration = Duration::from_secs(32);

/// A quiet period this long resets the restart delay to its initial value.
const RESET_RESTART_DELAY: Duration = Duration::from_secs(10 * 60);

/// Network changes this soon after bring-up are ignored: the tunnel opening
/// tends to produce false-positive connectivity broadcasts.
const NETWORK_CHANGE_GRACE: Duration = Duration::from_secs(5);

/// Capacity of each event channel.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Exponential backoff with reset for device restarts.
///
/// A restart is permitted once the configured delay has passed since the
/// last one. Each permitted restart doubles the delay up to the ceiling;
/// a long quiet period resets it.
#[derive(Debug)]
struct RestartPolicy {
    last_restart: Instant,
    next_delay: Duration,
}

impl RestartPolicy {
    fn new() -> Self {
        Self {
            last_restart: Instant::now(),
            next_delay: INITIAL_RESTART_DELAY,
        }
    }

    fn should_restart(&mut self) -> bool {
        let now = Instant::now();
        let restart = now > self.last_restart + self.next_delay;
        if restart {
            if now > self.last_restart + RESET_RESTART_DELAY {
                self.next_delay = INITIAL_RESTART_DELAY;
            } else {
                self.next_delay = (self.next_delay * 2).min(MAX_RESTART_DELAY);
            }
            self.last_restart = now;
        }
        restart
    }
}

/// Receiving ends handed to the event loop on `start`.
struct LoopChannels {
    network_rx: mpsc::Receiver<bool>,
    socket_err_rx: mpsc::Receiver<BindError>,
    handshake_rx: mpsc::Receiver<HandshakeState>,
    close_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<WireGuardState>,
}

/// Supervises the WireGuard device in response to network availability,
/// handshake outcomes and socket errors.
///
/// The host calls [`set_network_available`](Self::set_network_available) on
/// every connectivity change; the device stays down until the network is
/// reported available. A repeated `true` is treated as a network change
/// (for example Wi-Fi to cellular) and restarts the connection on stream
/// transports.
///
/// [`get_state`](Self::get_state) waits for the next published state and is
/// meant to be polled from a dedicated loop. After [`close`](Self::close)
/// it yields [`WireGuardState::Disabled`] immediately.
pub struct WireGuardStateManager {
    network_tx: mpsc::Sender<bool>,
    socket_err_tx: mpsc::Sender<BindError>,
    handshake_tx: mpsc::Sender<HandshakeState>,
    close_tx: mpsc::Sender<()>,
    state_rx: AsyncMutex<watch::Receiver<WireGuardState>>,
    closed: Arc<AtomicBool>,
    transmission: Transmission,
    channels: parking_lot::Mutex<Option<LoopChannels>>,
}

impl WireGuardStateManager {
    /// Create a manager for the given transport.
    ///
    /// Restarts are suppressed entirely under UDP transmission: the
    /// datagram bind has no connection to reset.
    #[must_use]
    pub fn new(transmission: Transmission) -> Self {
        let (network_tx, network_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (socket_err_tx, socket_err_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (handshake_tx, handshake_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(WireGuardState::Disabled);

        Self {
            network_tx,
            socket_err_tx,
            handshake_tx,
            close_tx,
            state_rx: AsyncMutex::new(state_rx),
            closed: Arc::new(AtomicBool::new(false)),
            transmission,
            channels: parking_lot::Mutex::new(Some(LoopChannels {
                network_rx,
                socket_err_rx,
                handshake_rx,
                close_rx,
                state_tx,
            })),
        }
    }

    /// Spawn the event loop against a device. Call once.
    pub fn start(&self, device: Arc<dyn Device>) {
        let Some(channels) = self.channels.lock().take() else {
            warn!("state manager already started");
            return;
        };
        let event_loop = EventLoop {
            device,
            transmission: self.transmission,
            closed: Arc::clone(&self.closed),
            channels,
            is_net_available: false,
            was_net_available: None,
            started_at: None,
            restart: AsyncMutex::new(RestartPolicy::new()),
        };
        tokio::spawn(event_loop.run());
    }

    /// Report a network availability change.
    pub fn set_network_available(&self, available: bool) {
        if self.network_tx.try_send(available).is_err() {
            warn!(available, "network availability channel unavailable");
        }
    }

    /// Wait for the next published state.
    ///
    /// Returns [`WireGuardState::Disabled`] once the manager is closed.
    pub async fn get_state(&self) -> WireGuardState {
        let mut rx = self.state_rx.lock().await;
        match rx.changed().await {
            Ok(()) => *rx.borrow_and_update(),
            Err(_) => WireGuardState::Disabled,
        }
    }

    /// Stop the event loop. A final `Disabled` state is published first;
    /// any other in-flight publication is discarded.
    pub fn close(&self) {
        debug!("state manager closing");
        self.closed.store(true, Ordering::Release);
        let _ = self.close_tx.try_send(());
    }

    /// Sender the device glue posts handshake lifecycle events to.
    #[must_use]
    pub fn handshake_sender(&self) -> mpsc::Sender<HandshakeState> {
        self.handshake_tx.clone()
    }

    /// Sender the bind posts socket errors to.
    #[must_use]
    pub fn socket_err_sender(&self) -> mpsc::Sender<BindError> {
        self.socket_err_tx.clone()
    }
}

struct EventLoop {
    device: Arc<dyn Device>,
    transmission: Transmission,
    closed: Arc<AtomicBool>,
    channels: LoopChannels,
    is_net_available: bool,
    was_net_available: Option<bool>,
    /// When the device last came up because the network appeared.
    started_at: Option<Instant>,
    /// Serializes `set_active` against `maybe_restart` and owns the
    /// backoff state.
    restart: AsyncMutex<RestartPolicy>,
}

impl EventLoop {
    async fn run(mut self) {
        debug!("state manager loop started");
        loop {
            tokio::select! {
                Some(available) = self.channels.network_rx.recv() => {
                    let was = self.was_net_available;
                    self.is_net_available = available;
                    self.on_network_availability_change(was, available).await;
                    self.was_net_available = Some(available);
                }
                Some(err) = self.channels.socket_err_rx.recv() => {
                    if self.is_net_available {
                        self.handle_socket_error(&err).await;
                    }
                }
                Some(state) = self.channels.handshake_rx.recv() => {
                    if self.is_net_available {
                        self.handle_handshake_state(state).await;
                    }
                }
                _ = self.channels.close_rx.recv() => {
                    debug!("state manager loop ended");
                    self.channels.state_tx.send_replace(WireGuardState::Disabled);
                    return;
                }
                else => return,
            }
        }
    }

    async fn on_network_availability_change(&mut self, was: Option<bool>, available: bool) {
        if !available {
            self.post_state(WireGuardState::WaitingForNetwork);
        }
        match (was, available) {
            (None, true) => {
                debug!("network on");
                self.set_active(true).await;
                self.started_at = Some(Instant::now());
            }
            (Some(true), true) => {
                // The tunnel coming up can itself broadcast a connectivity
                // change; only react once the grace window has passed.
                let past_grace = self
                    .started_at
                    .is_some_and(|t| Instant::now() > t + NETWORK_CHANGE_GRACE);
                if past_grace {
                    debug!("network change detected");
                    self.maybe_restart().await;
                }
            }
            (Some(false), true) => {
                debug!("network back");
                self.set_active(true).await;
            }
            (Some(true), false) => {
                debug!("network gone");
                self.set_active(false).await;
            }
            _ => {}
        }
    }

    async fn set_active(&self, activate: bool) {
        let _policy = self.restart.lock().await;
        let result = if activate {
            self.post_state(WireGuardState::Connecting);
            self.device.up().await
        } else {
            self.device.down().await
        };
        if let Err(e) = result {
            error!(activate, error = %e, "device transition failed");
            self.post_state(WireGuardState::Error);
        }
    }

    async fn handle_socket_error(&self, err: &BindError) {
        if err.is_connection_dropped() {
            error!(error = %err, "connection dropped");
            self.maybe_restart().await;
        } else {
            debug!(error = %err, "socket error observed");
        }
    }

    async fn handle_handshake_state(&self, state: HandshakeState) {
        match state {
            HandshakeState::Init => self.post_state(WireGuardState::Connecting),
            HandshakeState::Success => self.post_state(WireGuardState::Connected),
            HandshakeState::Fail => {
                self.post_state(WireGuardState::Error);
                self.maybe_restart().await;
            }
        }
    }

    /// Cycle the device if the backoff allows it.
    async fn maybe_restart(&self) {
        if self.transmission == Transmission::Udp {
            return;
        }
        let mut policy = self.restart.lock().await;
        if policy.should_restart() {
            debug!(next_delay = ?policy.next_delay, "restarting device");
            self.post_state(WireGuardState::Connecting);
            if let Err(e) = self.device.down().await {
                warn!(error = %e, "device down failed during restart");
            }
            if !self.closed.load(Ordering::Acquire) {
                if let Err(e) = self.device.up().await {
                    warn!(error = %e, "device up failed during restart");
                }
            }
        }
    }

    /// Publish a state unless the manager is closed or the network is away
    /// (in which case only `WaitingForNetwork` goes through).
    fn post_state(&self, state: WireGuardState) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if !self.is_net_available && state != WireGuardState::WaitingForNetwork {
            return;
        }
        self.channels.state_tx.send_replace(state);
    }
}
