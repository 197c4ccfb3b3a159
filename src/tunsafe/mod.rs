//! TunSafe stream framing for WireGuard datagrams
//!
//! WireGuard is datagram-oriented; carrying it over a TCP or TLS stream
//! requires a framing layer. This module implements the TunSafe wire format:
//! every WireGuard datagram becomes a length-prefixed record on the stream,
//! and runs of in-order data packets are compressed by eliding their
//! predictable 16-byte header.
//!
//! # Wire format
//!
//! ```text
//! +--------+--------+=================+
//! | type:2 |  length:14 (big-endian)  |  payload (length bytes)
//! +--------+--------+=================+
//! ```
//!
//! - `type = 0b00` (*Normal*): the payload is a complete WireGuard datagram.
//! - `type = 0b10` (*Data*): the payload is the body of a WireGuard data
//!   packet; the receiver reconstructs the 16-byte header from its stored
//!   prefix and counter before handing the packet up.
//! - Any other type value is a protocol error and fatal to the stream.
//!
//! # Header elision
//!
//! A WireGuard data packet starts with the tag `04 00 00 00`, a 4-byte
//! receiver index and an 8-byte little-endian counter. Consecutive packets
//! on one session differ only in the counter, which increments by one.
//! [`TunSafeCodec`] tracks the last prefix/counter seen in each direction:
//! when the next outbound packet matches the stored prefix and carries
//! exactly the successor counter, the 16-byte header is dropped from the
//! wire and regenerated on the far side.
//!
//! # Example
//!
//! ```
//! use wg_stream::tunsafe::{FrameHeader, TunSafeCodec, TUNSAFE_TYPE_NORMAL};
//!
//! let mut sender = TunSafeCodec::new();
//! let frame = sender.encode(b"hello");
//! let header = FrameHeader::parse([frame[0], frame[1]]);
//! assert_eq!(header.frame_type, TUNSAFE_TYPE_NORMAL);
//! assert_eq!(header.payload_len, 5);
//! ```

mod codec;

pub use codec::{FrameHeader, TunSafeCodec, UnknownFrameType};

/// Leading tag of a WireGuard data packet.
pub const WG_DATA_TAG: [u8; 4] = [4, 0, 0, 0];

/// Size of the full WireGuard data-packet header (tag, receiver index,
/// counter).
pub const WG_DATA_HEADER_SIZE: usize = 16;

/// Size of the WireGuard data-packet prefix (header without the counter).
pub const WG_DATA_PREFIX_SIZE: usize = 8;

/// Size of the TunSafe frame header on the wire.
pub const TUNSAFE_HEADER_SIZE: usize = 2;

/// Frame carries a complete WireGuard datagram.
pub const TUNSAFE_TYPE_NORMAL: u8 = 0b00;

/// Frame carries a data-packet body with the 16-byte header elided.
pub const TUNSAFE_TYPE_DATA: u8 = 0b10;

/// Largest payload expressible in the 14-bit length field.
pub const TUNSAFE_MAX_PAYLOAD: usize = 0x3FFF;
