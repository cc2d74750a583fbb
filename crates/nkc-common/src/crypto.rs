//! secp256k1 key handling, Schnorr signatures and ECDH.
//!
//! Wraps `k256` with the small surface the agent needs: BIP-340 signatures
//! over 32-byte event ids, and the x-coordinate ECDH secret used by the
//! NIP-04 payload cipher.

use crate::keys::{self, KeyDecodeError};
use crate::Pubkey;
use k256::ecdh::diffie_hellman;
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors produced by key parsing, signing and key agreement.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Secret key bytes are zero, out of range, or the wrong length.
    #[error("invalid secret key")]
    InvalidSecretKey,
    /// Public key is not a valid x-only curve point.
    #[error("invalid public key")]
    InvalidPublicKey,
    /// Hex decoding of a key failed.
    #[error(transparent)]
    Decode(#[from] KeyDecodeError),
    /// The Schnorr signer rejected the input.
    #[error("signing failed")]
    Signing,
}

/// A secp256k1 keypair able to sign events and derive shared secrets.
///
/// The secret scalar is zeroized on drop by `k256`.
#[derive(Clone)]
pub struct SigningKeys {
    secret: SecretKey,
    schnorr: SigningKey,
}

impl std::fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeys")
            .field("public_key", &keys::encode(&self.public_key()))
            .finish_non_exhaustive()
    }
}

impl SigningKeys {
    /// Generates a fresh random keypair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let schnorr = SigningKey::from(secret.to_nonzero_scalar());
        Self { secret, schnorr }
    }

    /// Builds a keypair from a raw 32-byte secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSecretKey`] if the bytes are not a
    /// valid non-zero scalar.
    ///
    /// # Examples
    ///
    /// ```
    /// use nkc_common::crypto::SigningKeys;
    ///
    /// let keys = SigningKeys::from_secret_bytes(&[7u8; 32]).unwrap();
    /// assert_eq!(keys.public_key().len(), 32);
    /// assert!(SigningKeys::from_secret_bytes(&[0u8; 32]).is_err());
    /// ```
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        let schnorr = SigningKey::from(secret.to_nonzero_scalar());
        Ok(Self { secret, schnorr })
    }

    /// Builds a keypair from a 64-character lowercase hex secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decode`] for malformed hex and
    /// [`CryptoError::InvalidSecretKey`] for an out-of-range scalar.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(keys::decode_pubkey(s.trim())?);
        Self::from_secret_bytes(bytes.as_ref())
    }

    /// Returns the x-only public key.
    #[must_use]
    pub fn public_key(&self) -> Pubkey {
        self.schnorr.verifying_key().to_bytes().into()
    }

    /// Returns the raw secret bytes, wiped when the guard drops.
    #[must_use]
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes().into())
    }

    /// Produces a BIP-340 signature over a 32-byte message digest.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Signing`] if the signer fails, which only
    /// happens for degenerate nonces.
    pub fn sign(&self, digest: &[u8; 32]) -> Result<[u8; 64], CryptoError> {
        let mut aux = [0u8; 32];
        OsRng.fill_bytes(&mut aux);
        let sig = self
            .schnorr
            .sign_raw(digest, &aux)
            .map_err(|_| CryptoError::Signing)?;
        Ok(sig.to_bytes())
    }

    /// Computes the ECDH shared secret with `peer`: the x-coordinate of
    /// `secret * peer_point`, lifting the x-only key to its even-y point.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if `peer` is not on the curve.
    ///
    /// # Examples
    ///
    /// ```
    /// use nkc_common::crypto::SigningKeys;
    ///
    /// let a = SigningKeys::from_secret_bytes(&[1u8; 32]).unwrap();
    /// let b = SigningKeys::from_secret_bytes(&[2u8; 32]).unwrap();
    /// let ab = a.shared_secret(&b.public_key()).unwrap();
    /// let ba = b.shared_secret(&a.public_key()).unwrap();
    /// assert_eq!(*ab, *ba);
    /// ```
    pub fn shared_secret(&self, peer: &Pubkey) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let point = lift_x(peer)?;
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), point.as_affine());
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }
}

/// Verifies a BIP-340 signature over a 32-byte digest.
///
/// Returns `true` only if the key, signature and digest all check out.
#[must_use]
pub fn verify(pubkey: &Pubkey, digest: &[u8; 32], signature: &[u8; 64]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(pubkey) else {
        return false;
    };
    let Ok(sig) = Signature::try_from(signature.as_slice()) else {
        return false;
    };
    vk.verify_raw(digest, &sig).is_ok()
}

/// Returns `true` if `pubkey` is a valid x-only curve point.
#[must_use]
pub fn is_valid_pubkey(pubkey: &Pubkey) -> bool {
    VerifyingKey::from_bytes(pubkey).is_ok()
}

fn lift_x(pubkey: &Pubkey) -> Result<PublicKey, CryptoError> {
    let mut sec1 = [0u8; 33];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(pubkey);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Returns `n` random bytes as lowercase hex.
///
/// # Examples
///
/// ```
/// let id = nkc_common::crypto::random_hex(16);
/// assert_eq!(id.len(), 32);
/// ```
#[must_use]
pub fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    keys::encode(&buf)
}

/// Returns the current Unix timestamp in seconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
///
/// # Examples
///
/// ```
/// let now = nkc_common::crypto::unix_now();
/// assert!(now > 1_700_000_000);
/// ```
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
