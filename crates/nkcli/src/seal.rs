//! Passphrase sealing of private keys at rest.
//!
//! The symmetric key is `SHA-256(passphrase)`; the cipher is
//! ChaCha20-Poly1305 with a fresh random 12-byte nonce.
//!
//! Wire format: `[nonce (12B) | ciphertext+tag]`.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Errors from seal/open operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SealError {
    /// Authentication failed. A wrong passphrase and corrupted data are
    /// indistinguishable.
    #[error("wrong passphrase")]
    WrongPassphrase,
    /// The cipher refused to encrypt.
    #[error("encryption failed")]
    Encrypt,
}

fn derive_key(passphrase: &str) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(Sha256::digest(passphrase.as_bytes()).into())
}

/// Encrypts `plaintext` under `passphrase`.
///
/// # Errors
///
/// Returns [`SealError::Encrypt`] if the cipher fails, which does not
/// happen for inputs below the ChaCha20 block counter limit.
pub fn seal(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>, SealError> {
    let key = derive_key(passphrase);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ct = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| SealError::Encrypt)?;

    let mut wire = Vec::with_capacity(NONCE_LEN + ct.len());
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&ct);
    Ok(wire)
}

/// Decrypts a blob produced by [`seal`].
///
/// # Errors
///
/// Returns [`SealError::WrongPassphrase`] whenever authentication fails,
/// including for truncated input.
pub fn open(sealed: &[u8], passphrase: &str) -> Result<Zeroizing<Vec<u8>>, SealError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(SealError::WrongPassphrase);
    }
    let (nonce, ct) = sealed.split_at(NONCE_LEN);
    let key = derive_key(passphrase);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map(Zeroizing::new)
        .map_err(|_| SealError::WrongPassphrase)
}
