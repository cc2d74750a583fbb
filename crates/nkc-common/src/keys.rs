//! Hex encoding and decoding utilities for public keys and ids.
//!
//! Wraps the `hex` crate with fixed-length helpers for the 32-byte
//! x-only keys and event ids used throughout the protocol.

use thiserror::Error;

pub use hex::FromHexError;

/// Errors that can occur when decoding a hex-encoded 32-byte value.
///
/// # Examples
///
/// ```
/// use nkc_common::keys;
/// // Wrong length returns WrongLength error
/// let short = keys::encode(&[1u8; 16]);
/// assert!(keys::decode_pubkey(&short).is_err());
/// ```
#[derive(Debug, Error)]
pub enum KeyDecodeError {
    /// The input is not valid hex.
    #[error("invalid hex: {0}")]
    Hex(#[from] FromHexError),
    /// The decoded bytes are not exactly 32 bytes.
    #[error("key must be exactly 32 bytes, got {0}")]
    WrongLength(usize),
    /// Uppercase or otherwise non-canonical encoding.
    #[error("key must be lowercase hex")]
    NotCanonical,
}

/// Encodes raw bytes to a lowercase hex string.
///
/// # Examples
///
/// ```
/// assert_eq!(nkc_common::keys::encode(&[0xab, 0x01]), "ab01");
/// ```
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decodes a lowercase hex string into a 32-byte array.
///
/// Uppercase input is rejected so that every key has exactly one textual
/// form on the wire and in storage.
///
/// # Errors
///
/// Returns [`KeyDecodeError`] if the input is not lowercase hex or does
/// not decode to exactly 32 bytes.
///
/// # Examples
///
/// ```
/// let pubkey = [0x42u8; 32];
/// let encoded = nkc_common::keys::encode(&pubkey);
/// let decoded = nkc_common::keys::decode_pubkey(&encoded).unwrap();
/// assert_eq!(decoded, pubkey);
/// ```
pub fn decode_pubkey(s: &str) -> Result<[u8; 32], KeyDecodeError> {
    if s.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(KeyDecodeError::NotCanonical);
    }
    let bytes = hex::decode(s)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_: Vec<u8>| KeyDecodeError::WrongLength(len))
}

/// Returns `true` if `s` is a canonical 64-character lowercase hex key.
#[must_use]
pub fn is_hex_key(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
