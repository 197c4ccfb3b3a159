//! TunSafe frame codec
//!
//! [`TunSafeCodec`] holds the per-direction prefix/counter state for one
//! stream. It is not thread-safe; each direction has a single owner and
//! callers serialize access.

use thiserror::Error;

use super::{
    TUNSAFE_HEADER_SIZE, TUNSAFE_MAX_PAYLOAD, TUNSAFE_TYPE_DATA, TUNSAFE_TYPE_NORMAL,
    WG_DATA_HEADER_SIZE, WG_DATA_PREFIX_SIZE, WG_DATA_TAG,
};

/// Frame header with an unsupported type value; fatal to the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown TunSafe frame type {type_bits:#04b}")]
pub struct UnknownFrameType {
    /// Raw type bits from the header (top two bits of byte 0).
    pub type_bits: u8,
}

/// Parsed TunSafe frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw frame type bits.
    pub frame_type: u8,
    /// Payload length following the header.
    pub payload_len: usize,
}

impl FrameHeader {
    /// Parse the two-byte wire header.
    #[must_use]
    pub fn parse(bytes: [u8; TUNSAFE_HEADER_SIZE]) -> Self {
        Self {
            frame_type: bytes[0] >> 6,
            payload_len: usize::from(bytes[0] & 0b0011_1111) << 8 | usize::from(bytes[1]),
        }
    }

    /// Encode a header with the given type and payload length.
    ///
    /// The length must fit the 14-bit field.
    #[must_use]
    pub fn encode(frame_type: u8, payload_len: usize) -> [u8; TUNSAFE_HEADER_SIZE] {
        debug_assert!(payload_len <= TUNSAFE_MAX_PAYLOAD);
        [
            frame_type << 6 | (payload_len >> 8) as u8,
            (payload_len & 0xff) as u8,
        ]
    }
}

/// Framing state for one TunSafe stream.
///
/// The send side remembers the prefix/counter of the last data packet put on
/// the wire so the next in-order packet can be elided; the receive side
/// remembers the prefix/counter learned from Normal frames so elided frames
/// can be reconstructed.
#[derive(Debug, Default)]
pub struct TunSafeCodec {
    send_prefix: [u8; WG_DATA_PREFIX_SIZE],
    send_count: u64,
    recv_prefix: [u8; WG_DATA_PREFIX_SIZE],
    recv_count: u64,
}

impl TunSafeCodec {
    /// Create a codec with zeroed state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset both counters.
    ///
    /// Prefixes are preserved: after a reconnect the peer may pick up at
    /// the known next counter, in which case elision resumes immediately.
    /// If it restarted its counter instead, the first data packet fails the
    /// counter check and re-primes through a Normal frame.
    pub fn clear(&mut self) {
        self.send_count = 0;
        self.recv_count = 0;
    }

    /// Allocate the buffer an incoming frame deframes into.
    ///
    /// Returns the buffer and the offset the payload should be read to.
    /// For a Data frame the first 16 bytes already hold the reconstructed
    /// WireGuard header (stored prefix, then the receive counter as it was
    /// before the post-receive increment).
    ///
    /// # Errors
    ///
    /// Returns [`UnknownFrameType`] for any type other than Normal or Data.
    pub fn prepare_packet(
        &self,
        frame_type: u8,
        payload_len: usize,
    ) -> Result<(Vec<u8>, usize), UnknownFrameType> {
        match frame_type {
            TUNSAFE_TYPE_NORMAL => Ok((vec![0; payload_len], 0)),
            TUNSAFE_TYPE_DATA => {
                let mut packet = vec![0; payload_len + WG_DATA_HEADER_SIZE];
                packet[..WG_DATA_PREFIX_SIZE].copy_from_slice(&self.recv_prefix);
                packet[WG_DATA_PREFIX_SIZE..WG_DATA_HEADER_SIZE]
                    .copy_from_slice(&self.recv_count.to_le_bytes());
                Ok((packet, WG_DATA_HEADER_SIZE))
            }
            type_bits => Err(UnknownFrameType { type_bits }),
        }
    }

    /// Account for a fully deframed packet.
    ///
    /// A Normal frame carrying a data-tagged packet refreshes the receive
    /// prefix/counter; every frame, regardless of type, advances the
    /// receive counter by one.
    pub fn on_receive(&mut self, frame_type: u8, packet: &[u8]) {
        if frame_type == TUNSAFE_TYPE_NORMAL
            && packet.len() >= WG_DATA_HEADER_SIZE
            && packet.starts_with(&WG_DATA_TAG)
        {
            self.recv_prefix
                .copy_from_slice(&packet[..WG_DATA_PREFIX_SIZE]);
            self.recv_count = read_counter(packet);
        }
        self.recv_count = self.recv_count.wrapping_add(1);
    }

    /// Frame an outbound WireGuard datagram.
    ///
    /// Emits a Data frame when the datagram is the in-order successor of
    /// the last data packet sent (and the elided body fits the length
    /// field); otherwise emits a Normal frame, priming the send state when
    /// the datagram is data-tagged.
    #[must_use]
    pub fn encode(&mut self, datagram: &[u8]) -> Vec<u8> {
        if datagram.len() < WG_DATA_HEADER_SIZE {
            return encode_normal(datagram);
        }
        let is_data = datagram.starts_with(&WG_DATA_TAG);
        let prefix = &datagram[..WG_DATA_PREFIX_SIZE];
        let count = read_counter(datagram);
        let body_len = datagram.len() - WG_DATA_HEADER_SIZE;
        if is_data
            && prefix == self.send_prefix
            && count == self.send_count.wrapping_add(1)
            && body_len <= TUNSAFE_MAX_PAYLOAD
        {
            self.send_count = self.send_count.wrapping_add(1);
            encode_data(datagram)
        } else {
            if is_data {
                self.send_prefix.copy_from_slice(prefix);
                self.send_count = count;
            }
            encode_normal(datagram)
        }
    }

    /// Counter of the last elided outbound data packet.
    #[must_use]
    pub fn send_count(&self) -> u64 {
        self.send_count
    }

    /// Total number of frames received.
    #[must_use]
    pub fn recv_count(&self) -> u64 {
        self.recv_count
    }
}

/// Read the little-endian counter out of a data-packet header.
fn read_counter(packet: &[u8]) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&packet[WG_DATA_PREFIX_SIZE..WG_DATA_HEADER_SIZE]);
    u64::from_le_bytes(bytes)
}

/// Wrap a whole datagram in a Normal frame.
fn encode_normal(datagram: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(TUNSAFE_HEADER_SIZE + datagram.len());
    frame.extend_from_slice(&FrameHeader::encode(TUNSAFE_TYPE_NORMAL, datagram.len()));
    frame.extend_from_slice(datagram);
    frame
}

/// Wrap a data packet in a Data frame, dropping its 16-byte header.
fn encode_data(datagram: &[u8]) -> Vec<u8> {
    let body = &datagram[WG_DATA_HEADER_SIZE..];
    let mut frame = Vec::with_capacity(TUNSAFE_HEADER_SIZE + body.len());
    frame.extend_from_slice(&FrameHeader::encode(TUNSAFE_TYPE_DATA, body.len()));
    frame.extend_from_slice(body);
    frame
}
