//! Stream bind over TCP or TLS
//!
//! [`StreamBind`] owns the single long-lived connection a WireGuard device
//! sends and receives datagrams through. Datagrams are framed with the
//! TunSafe codec in both directions.
//!
//! The connection is lazy: `open` only marks the bind usable, and the first
//! `send` or receive dials the endpoint (and upgrades to TLS when
//! configured). Any failure on that path latches the bind closed so callers
//! see [`BindError::Closed`] instead of a redial storm.

use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, error, trace};

use crate::tunsafe::{FrameHeader, TunSafeCodec, TUNSAFE_HEADER_SIZE};

use super::endpoint::StreamEndpoint;
use super::error::BindError;
use super::tls;

/// At most one log line per error category in this window.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Platform hook that excludes a socket from the VPN routing table.
///
/// Invoked with the raw fd of every freshly dialed socket, before any TLS
/// handshake. A negative return latches the bind closed with
/// [`BindError::ProtectFailed`].
pub type ProtectSocket = Arc<dyn Fn(i32) -> i32 + Send + Sync>;

/// Configuration for a [`StreamBind`].
#[derive(Debug, Clone)]
pub struct StreamBindConfig {
    /// Wrap the TCP connection in TLS.
    pub use_tls: bool,

    /// TCP connect timeout.
    pub connect_timeout: Duration,

    /// TLS handshake deadline.
    pub handshake_timeout: Duration,

    /// Pause after a successful TLS handshake before the stream is used.
    /// Some servers drop the first WireGuard handshake without it.
    pub post_handshake_delay: Duration,
}

impl Default for StreamBindConfig {
    fn default() -> Self {
        Self {
            use_tls: false,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            post_handshake_delay: Duration::from_millis(100),
        }
    }
}

impl StreamBindConfig {
    /// Plain TCP configuration.
    #[must_use]
    pub fn tcp() -> Self {
        Self::default()
    }

    /// TLS-wrapped configuration.
    #[must_use]
    pub fn tls() -> Self {
        Self {
            use_tls: true,
            ..Self::default()
        }
    }

    /// Set the TCP connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the TLS handshake deadline.
    #[must_use]
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
}

/// The established connection, plain or TLS-wrapped.
enum TransportStream {
    Tcp(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Connection lifecycle state, guarded by the bind's state mutex.
#[derive(Default)]
struct ConnState {
    /// `open` has been called without a matching `close`.
    open: bool,
    /// The bind is unusable; every call returns `Closed`.
    closed: bool,
    /// The transport has been dialed (and upgraded, for TLS).
    connected: bool,
    /// Read half parked here between dialing and the receiver claiming it.
    pending_reader: Option<ReadHalf<TransportStream>>,
}

struct Inner {
    config: StreamBindConfig,
    endpoint: parking_lot::Mutex<Option<StreamEndpoint>>,
    /// Lifecycle state only. Held for bookkeeping, never across the dial,
    /// the TLS handshake, or stream I/O, so `close` is always able to take
    /// it promptly.
    conn: AsyncMutex<ConnState>,
    /// Serializes dial attempts: `send` and the receiver both connect
    /// lazily, and the loser of the race must find the winner's connection
    /// instead of dialing a second one.
    dialing: AsyncMutex<()>,
    /// Write half lives outside the state mutex so a blocked write never
    /// holds up connection acquisition or close.
    writer: AsyncMutex<Option<WriteHalf<TransportStream>>>,
    codec: parking_lot::Mutex<TunSafeCodec>,
    error_tx: mpsc::Sender<BindError>,
    protect: Option<ProtectSocket>,
    /// Flipped to true on close; wakes any receive or send blocked on the
    /// socket.
    shutdown_tx: watch::Sender<bool>,
    log_gate: parking_lot::Mutex<HashMap<&'static str, Instant>>,
}

/// Stream transport bind for a single remote endpoint.
///
/// Cloning is cheap and shares the underlying connection; the WireGuard
/// device holds one clone for sending while the receive half lives in the
/// [`PacketReceiver`] returned by [`open`](Self::open).
#[derive(Clone)]
pub struct StreamBind {
    inner: Arc<Inner>,
}

impl StreamBind {
    /// Create a bind.
    ///
    /// Errors encountered on the socket are cloned onto `error_tx` for the
    /// supervisor (except `Closed`, which is normal shutdown). `protect`
    /// is the platform socket-protect hook, if any.
    #[must_use]
    pub fn new(
        config: StreamBindConfig,
        error_tx: mpsc::Sender<BindError>,
        protect: Option<ProtectSocket>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                endpoint: parking_lot::Mutex::new(None),
                conn: AsyncMutex::new(ConnState::default()),
                dialing: AsyncMutex::new(()),
                writer: AsyncMutex::new(None),
                codec: parking_lot::Mutex::new(TunSafeCodec::new()),
                error_tx,
                protect,
                shutdown_tx,
                log_gate: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Parse `ip:port` and record it as the bound endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::InvalidEndpoint`] when the string does not
    /// parse.
    pub fn parse_endpoint(&self, s: &str) -> Result<StreamEndpoint, BindError> {
        let endpoint: StreamEndpoint = s.parse()?;
        *self.inner.endpoint.lock() = Some(endpoint);
        Ok(endpoint)
    }

    /// The endpoint recorded by [`parse_endpoint`](Self::parse_endpoint).
    #[must_use]
    pub fn bound_endpoint(&self) -> Option<StreamEndpoint> {
        *self.inner.endpoint.lock()
    }

    /// Mark the bind open and hand out the receive half.
    ///
    /// Does not dial: the connection is established by the first `send` or
    /// receive. The hinted local port is returned unchanged; a stream
    /// socket picks its own source port at dial time.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::AlreadyOpen`] when called twice without an
    /// intervening close.
    pub async fn open(&self, port: u16) -> Result<(PacketReceiver, u16), BindError> {
        let mut conn = self.inner.conn.lock().await;
        if conn.open {
            return Err(BindError::AlreadyOpen);
        }
        debug!(port, "stream bind open");
        conn.open = true;
        conn.closed = false;
        self.inner.shutdown_tx.send_replace(false);
        Ok((PacketReceiver::new(self.clone()), port))
    }

    /// Frame one WireGuard datagram and write it to the stream, dialing
    /// first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::EndpointMismatch`] for an endpoint other than
    /// the bound one, [`BindError::Closed`] once the bind is closed, and
    /// transport errors otherwise. Transport errors are also forwarded to
    /// the supervisor channel and logged (rate limited).
    pub async fn send(&self, datagram: &[u8], endpoint: StreamEndpoint) -> Result<(), BindError> {
        let bound = match self.ensure_connected().await {
            Ok(bound) => bound,
            Err(e) => {
                self.log_limited("send connect", &e);
                return Err(e);
            }
        };
        if endpoint != bound {
            return Err(BindError::EndpointMismatch { bound });
        }

        let mut slot = self.inner.writer.lock().await;
        let Some(writer) = slot.as_mut() else {
            return Err(BindError::Closed);
        };
        let frame = self.inner.codec.lock().encode(datagram);
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let result = tokio::select! {
            res = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            } => res.map_err(BindError::from),
            _ = shutdown_rx.wait_for(|closed| *closed) => Err(BindError::Closed),
        };
        if let Err(e) = result {
            self.report_error(&e);
            self.log_limited("send", &e);
            return Err(e);
        }
        Ok(())
    }

    /// Close the bind: latch `closed`, wake blocked I/O, drop the
    /// connection and zero the codec counters.
    ///
    /// Idempotent.
    pub async fn close(&self) -> Result<(), BindError> {
        {
            let mut conn = self.inner.conn.lock().await;
            debug!("stream bind close");
            conn.closed = true;
            conn.open = false;
            conn.connected = false;
            conn.pending_reader = None;
        }
        // Wake a receiver or sender blocked on the socket, and abort any
        // in-flight dial, before taking the writer slot (which a blocked
        // sender may still hold).
        self.inner.shutdown_tx.send_replace(true);
        *self.inner.writer.lock().await = None;
        self.inner.codec.lock().clear();
        Ok(())
    }

    /// Stream sockets carry no fwmark; accepted and ignored.
    pub fn set_mark(&self, _mark: u32) -> Result<(), BindError> {
        Ok(())
    }

    /// Establish the connection if it does not exist yet.
    ///
    /// The state mutex is taken only to check and record state; the dial
    /// and TLS handshake run unlocked (serialized by the dial guard) and
    /// race against the shutdown signal so `close` aborts them. Any
    /// failure reports to the supervisor channel and latches the bind
    /// closed.
    async fn ensure_connected(&self) -> Result<StreamEndpoint, BindError> {
        let _dialing = self.inner.dialing.lock().await;

        let endpoint = {
            let mut conn = self.inner.conn.lock().await;
            if conn.closed {
                return Err(BindError::Closed);
            }
            let Some(endpoint) = self.bound_endpoint() else {
                conn.closed = true;
                return Err(BindError::InvalidEndpoint("no endpoint recorded".into()));
            };
            if conn.connected {
                return Ok(endpoint);
            }
            endpoint
        };

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let result = tokio::select! {
            res = self.establish(endpoint) => res,
            _ = shutdown_rx.wait_for(|closed| *closed) => Err(BindError::Closed),
        };

        let mut conn = self.inner.conn.lock().await;
        match result {
            Ok(stream) => {
                if conn.closed {
                    // close() ran while dialing; discard the socket.
                    return Err(BindError::Closed);
                }
                let (reader, writer) = tokio::io::split(stream);
                conn.connected = true;
                conn.pending_reader = Some(reader);
                *self.inner.writer.lock().await = Some(writer);
                Ok(endpoint)
            }
            Err(e) => {
                if !conn.closed {
                    self.report_error(&e);
                    conn.closed = true;
                }
                Err(e)
            }
        }
    }

    async fn establish(&self, endpoint: StreamEndpoint) -> Result<TransportStream, BindError> {
        let tcp = self.dial(endpoint).await?;
        if self.inner.config.use_tls {
            let tls = tls::upgrade(
                tcp,
                self.inner.config.handshake_timeout,
                self.inner.config.post_handshake_delay,
            )
            .await?;
            Ok(TransportStream::Tls(tls))
        } else {
            Ok(TransportStream::Tcp(tcp))
        }
    }

    async fn dial(&self, endpoint: StreamEndpoint) -> Result<TcpStream, BindError> {
        let addr = endpoint.addr();
        let connect_timeout = self.inner.config.connect_timeout;
        debug!(%addr, "dialing");
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                BindError::dial(
                    addr,
                    format!("connect timed out after {}s", connect_timeout.as_secs()),
                )
            })?
            .map_err(|e| BindError::dial(addr, e.to_string()))?;

        // Close must discard pending data, not wait for it to drain.
        SockRef::from(&stream).set_linger(Some(Duration::ZERO))?;
        stream.set_nodelay(true)?;

        if let Some(protect) = &self.inner.protect {
            let status = protect(stream.as_raw_fd());
            if status < 0 {
                return Err(BindError::ProtectFailed { status });
            }
            trace!(status, "socket protected");
        }
        debug!(%addr, "dial complete");
        Ok(stream)
    }

    /// Dial if needed and take the read half for the receiver.
    async fn acquire_reader(&self) -> Result<ReadHalf<TransportStream>, BindError> {
        self.ensure_connected().await?;
        let mut conn = self.inner.conn.lock().await;
        if conn.closed {
            return Err(BindError::Closed);
        }
        conn.pending_reader.take().ok_or(BindError::Closed)
    }

    fn prepare_packet(&self, header: FrameHeader) -> Result<(Vec<u8>, usize), BindError> {
        let codec = self.inner.codec.lock();
        Ok(codec.prepare_packet(header.frame_type, header.payload_len)?)
    }

    fn on_packet_received(&self, frame_type: u8, packet: &[u8]) {
        self.inner.codec.lock().on_receive(frame_type, packet);
    }

    /// Forward an error to the supervisor channel. `Closed` is normal
    /// shutdown and never forwarded.
    fn report_error(&self, err: &BindError) {
        if err.is_closed() {
            return;
        }
        if self.inner.error_tx.try_send(err.clone()).is_err() {
            trace!("supervisor error channel unavailable, dropping error");
        }
    }

    /// Log at most one error per category per 5 seconds.
    fn log_limited(&self, category: &'static str, err: &BindError) {
        let mut gate = self.inner.log_gate.lock();
        let now = Instant::now();
        let due = gate
            .get(category)
            .map_or(true, |last| now.duration_since(*last) >= ERROR_LOG_INTERVAL);
        if due {
            gate.insert(category, now);
            error!(category, error = %err, "stream bind error");
        }
    }
}

/// Receive half of a [`StreamBind`].
///
/// Single reader: exactly one receiver exists per open. A frame larger than
/// the caller's buffer is handed out across successive calls.
pub struct PacketReceiver {
    bind: StreamBind,
    reader: Option<ReadHalf<TransportStream>>,
    current: Bytes,
    shutdown_rx: watch::Receiver<bool>,
}

impl PacketReceiver {
    fn new(bind: StreamBind) -> Self {
        let shutdown_rx = bind.inner.shutdown_tx.subscribe();
        Self {
            bind,
            reader: None,
            current: Bytes::new(),
            shutdown_rx,
        }
    }

    /// Receive the next WireGuard datagram (or the remainder of one), and
    /// the endpoint it came from.
    ///
    /// Dials lazily through the same path as `send`. Blocks until a frame
    /// arrives or the bind is closed.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::Closed`] after close; transport and framing
    /// errors are fatal to the stream and also forwarded to the supervisor
    /// channel.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<(usize, StreamEndpoint), BindError> {
        if self.current.is_empty() {
            self.fill_next_packet().await?;
        }
        let n = self.current.len().min(buf.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        let endpoint = self.bind.bound_endpoint().ok_or(BindError::Closed)?;
        Ok((n, endpoint))
    }

    async fn fill_next_packet(&mut self) -> Result<(), BindError> {
        if self.reader.is_none() {
            match self.bind.acquire_reader().await {
                Ok(reader) => self.reader = Some(reader),
                Err(e) => {
                    self.bind.log_limited("recv connect", &e);
                    return Err(e);
                }
            }
        }

        let result = {
            let Self {
                bind,
                reader,
                shutdown_rx,
                ..
            } = self;
            match reader.as_mut() {
                Some(reader) => read_one_packet(bind, reader, shutdown_rx).await,
                None => Err(BindError::Closed),
            }
        };
        match result {
            Ok(packet) => {
                self.current = Bytes::from(packet);
                Ok(())
            }
            Err(e) => {
                if e.is_closed() {
                    // Drop our half so the socket actually closes.
                    self.reader = None;
                } else {
                    self.bind.report_error(&e);
                    self.bind.log_limited("recv", &e);
                }
                Err(e)
            }
        }
    }
}

/// Read one frame off the stream and reconstruct the WireGuard datagram.
async fn read_one_packet(
    bind: &StreamBind,
    reader: &mut ReadHalf<TransportStream>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<Vec<u8>, BindError> {
    let mut header = [0; TUNSAFE_HEADER_SIZE];
    read_full(reader, shutdown_rx, &mut header).await?;
    let header = FrameHeader::parse(header);
    let (mut packet, offset) = bind.prepare_packet(header)?;
    read_full(reader, shutdown_rx, &mut packet[offset..]).await?;
    bind.on_packet_received(header.frame_type, &packet);
    Ok(packet)
}

/// `read_exact` that aborts with `Closed` when the bind shuts down.
async fn read_full(
    reader: &mut ReadHalf<TransportStream>,
    shutdown_rx: &mut watch::Receiver<bool>,
    buf: &mut [u8],
) -> Result<(), BindError> {
    tokio::select! {
        res = reader.read_exact(buf) => match res {
            Ok(_) => Ok(()),
            Err(e) => Err(e.into()),
        },
        _ = shutdown_rx.wait_for(|closed| *closed) => Err(BindError::Closed),
    }
}
