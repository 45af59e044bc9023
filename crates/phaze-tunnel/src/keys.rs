//! Session Key Material
//!
//! The tunnel client does not negotiate keys. It is handed 32 bytes of
//! shared secret (a pre-shared key or the output of an external key
//! exchange) and derives per-session, per-direction frame keys from it.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use blake2::Blake2sMac256;
use blake2::digest::{KeyInit, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroize;

/// Length of session key material in bytes
pub const KEY_LEN: usize = 32;

/// Domain separation label for frame key derivation
const FRAME_KEY_LABEL: &[u8] = b"phaze-tunnel frame key v1";

/// Direction a frame travels in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client (tunnel initiator) to server
    ClientToServer,
    /// Server to client
    ServerToClient,
}

impl Direction {
    /// Label mixed into key derivation
    fn label(self) -> &'static [u8] {
        match self {
            Direction::ClientToServer => b"c2s",
            Direction::ServerToClient => b"s2c",
        }
    }

    /// Four byte tag placed in front of the sequence number in nonces
    pub fn nonce_tag(self) -> [u8; 4] {
        match self {
            Direction::ClientToServer => *b"PZc>",
            Direction::ServerToClient => *b"PZ<s",
        }
    }

    /// The opposite direction
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

/// Shared session key material (32 bytes)
///
/// Wiped from memory when dropped.
#[derive(Clone)]
pub struct SessionKey {
    bytes: [u8; KEY_LEN],
}

impl SessionKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Generate fresh random key material
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        let mut decoded = BASE64.decode(s.trim())
            .map_err(|_| KeyError::InvalidBase64)?;

        if decoded.len() != KEY_LEN {
            decoded.zeroize();
            return Err(KeyError::InvalidLength);
        }

        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { bytes })
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }

    /// Derive the frame key for one session and direction.
    ///
    /// BLAKE2s-MAC keyed with the key material over
    /// `label || direction || session_id`.
    pub fn derive(&self, session_id: u32, direction: Direction) -> [u8; KEY_LEN] {
        let mut mac = <Blake2sMac256 as KeyInit>::new((&self.bytes).into());
        mac.update(FRAME_KEY_LABEL);
        mac.update(direction.label());
        mac.update(&session_id.to_be_bytes());

        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey([redacted])")
    }
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}
