//! Signed event format.
//!
//! An event's id is `SHA-256` of the compact JSON array
//! `[0, pubkey, created_at, kind, tags, content]`; its signature is a
//! BIP-340 Schnorr signature over that id by `pubkey`.

use crate::crypto::{self, CryptoError, SigningKeys};
use crate::keys::{self, KeyDecodeError};
use crate::types::{EventId, Pubkey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// An event tag: a tag name followed by its values.
pub type Tag = Vec<String>;

/// Errors raised when building or checking an event.
#[derive(Debug, Error)]
pub enum EventError {
    /// The `id` does not match the canonical hash of the event fields.
    #[error("event id mismatch")]
    IdMismatch,
    /// The signature does not verify against `pubkey`.
    #[error("invalid event signature")]
    BadSignature,
    /// A hex field (`id`, `pubkey`, `sig`) is malformed.
    #[error("malformed field `{field}`: {source}")]
    Field {
        /// Name of the malformed field.
        field: &'static str,
        /// Underlying decode error.
        #[source]
        source: KeyDecodeError,
    },
    /// Signing failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// The fields a signer commits to, before an id and signature are attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Event kind.
    pub kind: u16,
    /// Ordered tag list.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Free-form content.
    #[serde(default)]
    pub content: String,
}

impl UnsignedEvent {
    /// Creates an unsigned event stamped with the current time.
    #[must_use]
    pub fn new(kind: u16, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            created_at: crypto::unix_now(),
            kind,
            tags,
            content: content.into(),
        }
    }

    /// Computes the canonical id these fields hash to under `pubkey`.
    #[must_use]
    pub fn id_for(&self, pubkey: &Pubkey) -> EventId {
        compute_id(
            pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Signs the event with `signer`, producing a complete [`Event`].
    ///
    /// The event's `pubkey` is always the signer's key.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Crypto`] if the Schnorr signer fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use nkc_common::crypto::SigningKeys;
    /// use nkc_common::event::UnsignedEvent;
    ///
    /// let keys = SigningKeys::generate();
    /// let event = UnsignedEvent::new(1, vec![], "hello").sign(&keys).unwrap();
    /// assert!(event.verify().is_ok());
    /// ```
    pub fn sign(self, signer: &SigningKeys) -> Result<Event, EventError> {
        let pubkey = signer.public_key();
        let id = self.id_for(&pubkey);
        let sig = signer.sign(&id)?;
        Ok(Event {
            id: keys::encode(&id),
            pubkey: keys::encode(&pubkey),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: keys::encode(&sig),
        })
    }
}

/// A complete signed event as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hex-encoded event id.
    pub id: String,
    /// Hex-encoded x-only author key.
    pub pubkey: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Event kind.
    pub kind: u16,
    /// Ordered tag list.
    pub tags: Vec<Tag>,
    /// Content (ciphertext for encrypted kinds).
    pub content: String,
    /// Hex-encoded 64-byte Schnorr signature.
    pub sig: String,
}

impl Event {
    /// Decodes the author key.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Field`] if `pubkey` is not 32 bytes of lowercase hex.
    pub fn author(&self) -> Result<Pubkey, EventError> {
        keys::decode_pubkey(&self.pubkey).map_err(|source| EventError::Field {
            field: "pubkey",
            source,
        })
    }

    /// Checks that the id matches the fields and the signature matches the id.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::IdMismatch`] or [`EventError::BadSignature`],
    /// or [`EventError::Field`] for malformed hex.
    pub fn verify(&self) -> Result<(), EventError> {
        let author = self.author()?;
        let expected = compute_id(
            &author,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        let id = keys::decode_pubkey(&self.id).map_err(|source| EventError::Field {
            field: "id",
            source,
        })?;
        if id != expected {
            return Err(EventError::IdMismatch);
        }
        let sig_bytes = hex::decode(&self.sig).map_err(|e| EventError::Field {
            field: "sig",
            source: KeyDecodeError::Hex(e),
        })?;
        let sig: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| EventError::BadSignature)?;
        if crypto::verify(&author, &id, &sig) {
            Ok(())
        } else {
            Err(EventError::BadSignature)
        }
    }

    /// Returns the first value of the first tag named `name`.
    #[must_use]
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// Returns `true` if the event carries a `p` tag naming `pubkey`.
    #[must_use]
    pub fn tags_pubkey(&self, pubkey: &Pubkey) -> bool {
        let hex = keys::encode(pubkey);
        self.tags
            .iter()
            .any(|t| t.first().map(String::as_str) == Some("p") && t.get(1) == Some(&hex))
    }
}

/// Computes `SHA-256([0, pubkey, created_at, kind, tags, content])`.
#[must_use]
pub fn compute_id(
    pubkey: &Pubkey,
    created_at: u64,
    kind: u16,
    tags: &[Tag],
    content: &str,
) -> EventId {
    let canonical = serde_json::json!([0, keys::encode(pubkey), created_at, kind, tags, content]);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hasher.finalize().into()
}

/// Builds a `["p", <hex>]` tag.
#[must_use]
pub fn p_tag(pubkey: &Pubkey) -> Tag {
    vec!["p".to_string(), keys::encode(pubkey)]
}
