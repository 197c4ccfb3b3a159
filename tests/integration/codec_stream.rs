//! Framed round-trips between a stream bind and a TunSafe-speaking peer
//!
//! The peer side drives the codec directly over a localhost TCP socket, so
//! these tests observe the actual bytes (and frame types) on the wire.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use wg_stream::bind::{BindError, StreamBind, StreamBindConfig};
use wg_stream::tunsafe::{
    FrameHeader, TunSafeCodec, TUNSAFE_TYPE_DATA, TUNSAFE_TYPE_NORMAL, WG_DATA_TAG,
};

use super::init_tracing;

/// Remote side of the stream: deframes and frames with its own codec.
struct TunSafePeer {
    stream: TcpStream,
    codec: TunSafeCodec,
}

impl TunSafePeer {
    async fn accept(listener: &TcpListener) -> io::Result<Self> {
        let (stream, _) = listener.accept().await?;
        Ok(Self {
            stream,
            codec: TunSafeCodec::new(),
        })
    }

    /// Frame and send a datagram; returns the frame type that went out.
    async fn send(&mut self, datagram: &[u8]) -> io::Result<u8> {
        let frame = self.codec.encode(datagram);
        self.stream.write_all(&frame).await?;
        Ok(frame[0] >> 6)
    }

    /// Receive one frame; returns the frame type and the reconstructed
    /// datagram.
    async fn recv(&mut self) -> io::Result<(u8, Vec<u8>)> {
        let mut header = [0; 2];
        self.stream.read_exact(&mut header).await?;
        let header = FrameHeader::parse(header);
        let (mut packet, offset) = self
            .codec
            .prepare_packet(header.frame_type, header.payload_len)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.stream.read_exact(&mut packet[offset..]).await?;
        self.codec.on_receive(header.frame_type, &packet);
        Ok((header.frame_type, packet))
    }
}

fn data_packet(index: [u8; 4], count: u64, body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&WG_DATA_TAG);
    packet.extend_from_slice(&index);
    packet.extend_from_slice(&count.to_le_bytes());
    packet.extend_from_slice(body);
    packet
}

async fn connected_pair() -> (StreamBind, wg_stream::bind::PacketReceiver, TcpListener) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (error_tx, _error_rx) = mpsc::channel(16);
    let bind = StreamBind::new(StreamBindConfig::tcp(), error_tx, None);
    bind.parse_endpoint(&listener.local_addr().unwrap().to_string())
        .unwrap();
    let (receiver, _) = bind.open(0).await.unwrap();
    (bind, receiver, listener)
}

#[tokio::test]
async fn test_framed_roundtrip_over_tcp() {
    let (bind, mut receiver, listener) = connected_pair().await;
    let endpoint = bind.bound_endpoint().unwrap();
    let index = [0xAA, 0xBB, 0xCC, 0xDD];

    let run = async {
        // First packet triggers the lazy dial.
        let handshake = vec![1, 0, 0, 0, 7, 7, 7, 7];
        bind.send(&handshake, endpoint).await.unwrap();
        let mut peer = TunSafePeer::accept(&listener).await.unwrap();
        let (frame_type, packet) = peer.recv().await.unwrap();
        assert_eq!(frame_type, TUNSAFE_TYPE_NORMAL);
        assert_eq!(packet, handshake);

        // Data run: the first primes (Normal), the rest elide.
        for count in 1..=3u64 {
            let packet = data_packet(index, count, format!("payload-{count}").as_bytes());
            bind.send(&packet, endpoint).await.unwrap();
            let (frame_type, received) = peer.recv().await.unwrap();
            let expected_type = if count == 1 {
                TUNSAFE_TYPE_NORMAL
            } else {
                TUNSAFE_TYPE_DATA
            };
            assert_eq!(frame_type, expected_type, "count {count}");
            assert_eq!(received, packet);
        }

        // A counter gap falls back to Normal on the wire.
        let gap = data_packet(index, 9, b"gap");
        bind.send(&gap, endpoint).await.unwrap();
        let (frame_type, received) = peer.recv().await.unwrap();
        assert_eq!(frame_type, TUNSAFE_TYPE_NORMAL);
        assert_eq!(received, gap);

        // Reverse direction: the bind's receiver reconstructs elided
        // frames from the peer.
        let mut buf = vec![0; 2048];
        for count in 1..=3u64 {
            let packet = data_packet([1, 2, 3, 4], count, format!("reply-{count}").as_bytes());
            let sent_type = peer.send(&packet).await.unwrap();
            if count > 1 {
                assert_eq!(sent_type, TUNSAFE_TYPE_DATA);
            }
            let (n, from) = receiver.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &packet[..]);
            assert_eq!(from, endpoint);
        }

        bind.close().await.unwrap();
    };
    timeout(Duration::from_secs(5), run).await.unwrap();
}

#[tokio::test]
async fn test_large_packet_spans_recv_calls() {
    let (bind, mut receiver, listener) = connected_pair().await;
    let endpoint = bind.bound_endpoint().unwrap();

    let run = async {
        bind.send(b"wake", endpoint).await.unwrap();
        let mut peer = TunSafePeer::accept(&listener).await.unwrap();
        peer.recv().await.unwrap();

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        peer.send(&payload).await.unwrap();

        // A 256-byte buffer drains the packet across four calls.
        let mut reassembled = Vec::new();
        let mut buf = vec![0; 256];
        while reassembled.len() < payload.len() {
            let (n, _) = receiver.recv(&mut buf).await.unwrap();
            assert!(n > 0);
            reassembled.extend_from_slice(&buf[..n]);
        }
        assert_eq!(reassembled, payload);

        bind.close().await.unwrap();
    };
    timeout(Duration::from_secs(5), run).await.unwrap();
}

#[tokio::test]
async fn test_unknown_frame_type_is_fatal() {
    let (bind, mut receiver, listener) = connected_pair().await;
    let endpoint = bind.bound_endpoint().unwrap();

    let run = async {
        bind.send(b"wake", endpoint).await.unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut discard = vec![0; 64];
        let _ = stream.read(&mut discard).await.unwrap();

        // Type bits 0b01 are not a valid TunSafe frame.
        stream.write_all(&[0b0100_0000, 4, 1, 2, 3, 4]).await.unwrap();

        let mut buf = vec![0; 64];
        let err = receiver.recv(&mut buf).await.unwrap_err();
        assert!(matches!(err, BindError::UnknownFrameType(_)), "{err:?}");
    };
    timeout(Duration::from_secs(5), run).await.unwrap();
}
