//! Key custody: sealing, storing, unlocking and describing agent keys.

use crate::error::AgentError;
use crate::seal;
use crate::store::{Database, KeySummary};
use nkc_common::keys;
use nkc_common::{Pubkey, SigningKeys};
use tracing::info;

/// A stored key: public half in the clear, private half sealed.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    /// Public key.
    pub pubkey: Pubkey,
    sealed: Vec<u8>,
}

impl KeyRecord {
    /// Loads the record for `pubkey`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::KeyNotFound`] if nothing is stored, or a
    /// store error.
    pub fn load(db: &Database, pubkey: &Pubkey) -> Result<Self, AgentError> {
        let sealed = db
            .key_blob(pubkey)?
            .ok_or_else(|| AgentError::KeyNotFound(keys::encode(pubkey)))?;
        Ok(Self {
            pubkey: *pubkey,
            sealed,
        })
    }

    /// Opens the sealed secret into an in-memory signing key.
    ///
    /// The result is never persisted and is wiped on drop.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::WrongPassphrase`] if authentication fails or
    /// the secret does not derive this record's public key.
    pub fn unlock(&self, passphrase: &str) -> Result<SigningKeys, AgentError> {
        let secret = seal::open(&self.sealed, passphrase)?;
        let signing =
            SigningKeys::from_secret_bytes(&secret).map_err(|_| AgentError::WrongPassphrase)?;
        if signing.public_key() != self.pubkey {
            return Err(AgentError::WrongPassphrase);
        }
        Ok(signing)
    }
}

/// Seals `signing` under `passphrase` and stores it.
///
/// # Errors
///
/// Returns an error if sealing or the store write fails.
pub fn store_key(db: &Database, signing: &SigningKeys, passphrase: &str) -> Result<Pubkey, AgentError> {
    let pubkey = signing.public_key();
    let sealed = seal::seal(signing.secret_bytes().as_ref(), passphrase)?;
    db.save_key(&pubkey, &sealed)?;
    info!(pubkey = %keys::encode(&pubkey), "key stored");
    Ok(pubkey)
}

/// Parses a hex private key for import.
///
/// # Errors
///
/// Returns [`AgentError::Validation`] for anything but a valid 64-char
/// lowercase hex scalar.
pub fn parse_secret(hex: &str) -> Result<SigningKeys, AgentError> {
    SigningKeys::from_hex(hex).map_err(|e| AgentError::Validation(format!("invalid private key: {e}")))
}

/// Parses a hex public key argument.
///
/// # Errors
///
/// Returns [`AgentError::Validation`] if it is not a 64-char lowercase hex key.
pub fn parse_pubkey(hex: &str) -> Result<Pubkey, AgentError> {
    Ok(keys::decode_pubkey(hex.trim())?)
}

/// Renders a key as `label (hex)` or `(no name) (hex)`.
#[must_use]
pub fn describe(summary: &KeySummary) -> String {
    let label = summary
        .profile
        .as_ref()
        .and_then(crate::store::ProfileMetadata::label)
        .unwrap_or_else(|| "(no name)".to_string());
    format!("{label} ({})", keys::encode(&summary.pubkey))
}
