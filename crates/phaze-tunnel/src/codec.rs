//! Frame Codec
//!
//! Wire format of a tunnel frame:
//!
//! ```text
//!  0      4   5    6       8            12                  20
//! +------+---+----+-------+------------+-------------------+------------------+-----+
//! | PHAZ | v |kind| len   | session id | sequence          | ciphertext       | tag |
//! +------+---+----+-------+------------+-------------------+------------------+-----+
//! ```
//!
//! The 20 byte header is authenticated as associated data, the payload is
//! sealed with ChaCha20-Poly1305. The nonce is a direction tag followed by
//! the sequence number, and keys are derived per session and direction,
//! so a frame only verifies for the session and direction it was made for.

use crate::keys::Direction;
use crate::session::Session;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::fmt;
use zeroize::Zeroize;

/// Frame magic
pub const MAGIC: [u8; 4] = *b"PHAZ";

/// Protocol version carried in every frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Header length in bytes
pub const HEADER_LEN: usize = 20;

/// Poly1305 tag length
pub const TAG_LEN: usize = 16;

/// Bytes added to every payload on the wire
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TAG_LEN;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Encapsulated IP packet
    Data = 0x10,
    /// Liveness probe, empty payload
    Keepalive = 0x20,
    /// Sender is going away
    Disconnect = 0x30,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(FrameKind::Data),
            0x20 => Some(FrameKind::Keepalive),
            0x30 => Some(FrameKind::Disconnect),
            _ => None,
        }
    }
}

/// Which end of the tunnel this codec sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The tunnel client
    Initiator,
    /// The remote endpoint
    Responder,
}

impl Role {
    fn send_direction(self) -> Direction {
        match self {
            Role::Initiator => Direction::ClientToServer,
            Role::Responder => Direction::ServerToClient,
        }
    }
}

/// An encoded frame ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    sequence: u64,
    bytes: Vec<u8>,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// An authenticated, decrypted frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub kind: FrameKind,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Seals and opens frames for one session
pub struct FrameCodec {
    session_id: u32,
    max_payload: usize,
    role: Role,
    send_cipher: ChaCha20Poly1305,
    recv_cipher: ChaCha20Poly1305,
}

impl FrameCodec {
    /// Build the codec for `session` as seen from `role`
    pub fn new(session: &Session, role: Role) -> Self {
        let tx = role.send_direction();
        Self {
            session_id: session.id(),
            max_payload: session.mtu() as usize,
            role,
            send_cipher: cipher_for(session, tx),
            recv_cipher: cipher_for(session, tx.reverse()),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Largest plaintext accepted by [`encode`](Self::encode)
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Seal `payload` into a frame with sequence number `seq`
    pub fn encode(&self, kind: FrameKind, payload: &[u8], seq: u64) -> Result<Frame, CodecError> {
        if payload.len() > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }

        let header = self.header(kind, payload.len() as u16, seq);
        let nonce = nonce(self.role.send_direction(), seq);

        let sealed = self
            .send_cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: payload, aad: &header })
            .map_err(|_| CodecError::EncryptionFailed)?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + sealed.len());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&sealed);

        Ok(Frame {
            kind,
            sequence: seq,
            bytes,
        })
    }

    /// Verify and open a frame received from the remote
    pub fn decode(&self, frame: &[u8]) -> Result<DecodedFrame, CodecError> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(CodecError::MalformedFrame("frame shorter than header and tag"));
        }

        let (header, sealed) = frame.split_at(HEADER_LEN);
        let seq = read_u64(&header[12..20]);
        let nonce = nonce(self.role.send_direction().reverse(), seq);

        let payload = self
            .recv_cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: sealed, aad: header })
            .map_err(|_| CodecError::AuthenticationFailed)?;

        // Everything below is authenticated
        if header[0..4] != MAGIC {
            return Err(CodecError::MalformedFrame("bad magic"));
        }
        if header[4] != PROTOCOL_VERSION {
            return Err(CodecError::MalformedFrame("unsupported version"));
        }
        let kind = FrameKind::from_u8(header[5])
            .ok_or(CodecError::MalformedFrame("unknown frame kind"))?;
        let len = u16::from_be_bytes([header[6], header[7]]) as usize;
        if len != payload.len() {
            return Err(CodecError::MalformedFrame("length mismatch"));
        }
        if read_u32(&header[8..12]) != self.session_id {
            return Err(CodecError::MalformedFrame("session id mismatch"));
        }
        if len > self.max_payload {
            return Err(CodecError::MalformedFrame("payload exceeds MTU"));
        }

        Ok(DecodedFrame {
            kind,
            sequence: seq,
            payload,
        })
    }

    fn header(&self, kind: FrameKind, len: u16, seq: u64) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC);
        header[4] = PROTOCOL_VERSION;
        header[5] = kind as u8;
        header[6..8].copy_from_slice(&len.to_be_bytes());
        header[8..12].copy_from_slice(&self.session_id.to_be_bytes());
        header[12..20].copy_from_slice(&seq.to_be_bytes());
        header
    }
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("max_payload", &self.max_payload)
            .finish_non_exhaustive()
    }
}

/// Read the sequence number of a frame without authenticating it.
///
/// Only good for a replay pre-check; the value must not be trusted.
pub fn peek_sequence(frame: &[u8]) -> Option<u64> {
    (frame.len() >= HEADER_LEN).then(|| read_u64(&frame[12..20]))
}

fn cipher_for(session: &Session, direction: Direction) -> ChaCha20Poly1305 {
    let mut key = session.key().derive(session.id(), direction);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();
    cipher
}

fn nonce(direction: Direction, seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&direction.nonce_tag());
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

/// Per-frame errors. None of these end a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Frame authentication failed")]
    AuthenticationFailed,

    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("Payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Frame encryption failed")]
    EncryptionFailed,

    #[error("Replayed or stale frame (sequence {sequence})")]
    Replayed { sequence: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::keys::SessionKey;

    fn session(id: u32) -> Session {
        Session::new(Endpoint::new("vpn.example.net", 51821), SessionKey::from_bytes([3u8; 32]))
            .with_id(id)
            .with_mtu(1400)
    }

    fn pair(id: u32) -> (FrameCodec, FrameCodec) {
        let session = session(id);
        (
            FrameCodec::new(&session, Role::Initiator),
            FrameCodec::new(&session, Role::Responder),
        )
    }

    #[test]
    fn test_roundtrip() {
        let (client, server) = pair(7);
        let packet = b"\x45\x00\x00\x1cipv4 packet bytes";

        let frame = client.encode(FrameKind::Data, packet, 42).unwrap();
        assert_eq!(frame.as_bytes().len(), packet.len() + FRAME_OVERHEAD);

        let decoded = server.decode(frame.as_bytes()).unwrap();
        assert_eq!(decoded.kind, FrameKind::Data);
        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.payload, packet);

        let reply = server.encode(FrameKind::Keepalive, &[], 0).unwrap();
        let decoded = client.decode(reply.as_bytes()).unwrap();
        assert_eq!(decoded.kind, FrameKind::Keepalive);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_every_bit_flip_fails_authentication() {
        let (client, server) = pair(7);
        let frame = client.encode(FrameKind::Data, b"flip me", 9).unwrap().into_bytes();

        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert_eq!(
                    server.decode(&corrupted),
                    Err(CodecError::AuthenticationFailed),
                    "byte {} bit {}",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_truncated_frame_is_malformed() {
        let (client, server) = pair(7);
        let frame = client.encode(FrameKind::Data, b"", 1).unwrap().into_bytes();

        assert!(server.decode(&frame).is_ok());
        assert!(matches!(
            server.decode(&frame[..frame.len() - 1]),
            Err(CodecError::MalformedFrame(_))
        ));
        assert!(matches!(server.decode(&[]), Err(CodecError::MalformedFrame(_))));
    }

    #[test]
    fn test_truncated_payload_fails_authentication() {
        let (client, server) = pair(7);
        let frame = client.encode(FrameKind::Data, b"a longer payload", 1).unwrap().into_bytes();

        assert_eq!(
            server.decode(&frame[..frame.len() - 4]),
            Err(CodecError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_other_session_rejected() {
        let (client, _) = pair(1);
        let (_, other_server) = pair(2);

        let frame = client.encode(FrameKind::Data, b"payload", 5).unwrap();
        assert_eq!(
            other_server.decode(frame.as_bytes()),
            Err(CodecError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_reflected_frame_rejected() {
        let (client, _) = pair(1);

        let frame = client.encode(FrameKind::Data, b"payload", 5).unwrap();
        assert_eq!(client.decode(frame.as_bytes()), Err(CodecError::AuthenticationFailed));
    }

    #[test]
    fn test_payload_too_large() {
        let (client, _) = pair(1);
        let oversized = vec![0u8; 1401];

        assert_eq!(
            client.encode(FrameKind::Data, &oversized, 0).unwrap_err(),
            CodecError::PayloadTooLarge { len: 1401, max: 1400 }
        );
        assert!(client.encode(FrameKind::Data, &oversized[..1400], 0).is_ok());
    }

    #[test]
    fn test_peek_sequence() {
        let (client, _) = pair(1);
        let frame = client.encode(FrameKind::Data, b"x", 0xDEAD_BEEF).unwrap();

        assert_eq!(peek_sequence(frame.as_bytes()), Some(0xDEAD_BEEF));
        assert_eq!(peek_sequence(&[0u8; 4]), None);
    }

    #[test]
    fn test_frame_kind_values() {
        assert_eq!(FrameKind::from_u8(0x10), Some(FrameKind::Data));
        assert_eq!(FrameKind::from_u8(0x20), Some(FrameKind::Keepalive));
        assert_eq!(FrameKind::from_u8(0x30), Some(FrameKind::Disconnect));
        assert_eq!(FrameKind::from_u8(0x11), None);
    }
}
