//! NIP-04 payload encryption.
//!
//! AES-256-CBC with PKCS#7 padding, keyed by the raw ECDH x-coordinate.
//! Payloads travel as `base64(ciphertext) + "?iv=" + base64(iv)`.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_SEPARATOR: &str = "?iv=";

/// Errors raised when decrypting a payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Nip04Error {
    /// The payload is not `<ciphertext>?iv=<iv>`.
    #[error("malformed payload")]
    Malformed,
    /// A base64 segment failed to decode.
    #[error("invalid base64")]
    Base64,
    /// The IV is not 16 bytes.
    #[error("iv must be 16 bytes, got {0}")]
    BadIv(usize),
    /// Padding check failed: wrong key or corrupted ciphertext.
    #[error("decryption failed")]
    Decrypt,
    /// Plaintext is not UTF-8.
    #[error("plaintext is not utf-8")]
    Utf8,
}

/// Encrypts `plaintext` under `shared_secret` with a fresh random IV.
///
/// # Examples
///
/// ```
/// use nkc_common::nip04;
///
/// let key = [9u8; 32];
/// let payload = nip04::encrypt(&key, "hello");
/// assert!(payload.contains("?iv="));
/// assert_eq!(nip04::decrypt(&key, &payload).unwrap(), "hello");
/// ```
#[must_use]
pub fn encrypt(shared_secret: &[u8; 32], plaintext: &str) -> String {
    let mut iv = [0u8; 16];
    OsRng.fill_bytes(&mut iv);
    let ct = Aes256CbcEnc::new(shared_secret.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    format!("{}{IV_SEPARATOR}{}", STANDARD.encode(ct), STANDARD.encode(iv))
}

/// Decrypts a payload produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`Nip04Error`] on malformed framing, bad base64, a wrong-length
/// IV, failed padding, or non-UTF-8 plaintext.
pub fn decrypt(shared_secret: &[u8; 32], payload: &str) -> Result<String, Nip04Error> {
    let (ct_b64, iv_b64) = payload
        .split_once(IV_SEPARATOR)
        .ok_or(Nip04Error::Malformed)?;
    let ct = STANDARD.decode(ct_b64).map_err(|_| Nip04Error::Base64)?;
    let iv = STANDARD.decode(iv_b64).map_err(|_| Nip04Error::Base64)?;
    let iv: [u8; 16] = iv
        .as_slice()
        .try_into()
        .map_err(|_| Nip04Error::BadIv(iv.len()))?;
    let pt = Aes256CbcDec::new(shared_secret.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ct)
        .map_err(|_| Nip04Error::Decrypt)?;
    String::from_utf8(pt).map_err(|_| Nip04Error::Utf8)
}
