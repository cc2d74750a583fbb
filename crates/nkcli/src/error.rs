use crate::connection::PairingError;
use crate::relay::RelayError;
use crate::seal::SealError;
use crate::store::StoreError;
use nkc_common::CryptoError;
use thiserror::Error;

/// Errors surfaced by agent operations.
///
/// Variants follow how far a failure reaches: transport and crypto errors
/// end one session, permission and validation errors become error
/// responses, store errors at start-up abort the whole run.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Relay connect, subscribe or publish failed.
    #[error("transport: {0}")]
    Transport(#[from] RelayError),
    /// Shared-secret, signing or decryption failure.
    #[error("crypto: {0}")]
    Crypto(String),
    /// The operator denied the request.
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    /// Unlock failed.
    #[error("wrong passphrase")]
    WrongPassphrase,
    /// Malformed input from the operator or a counterparty.
    #[error("invalid input: {0}")]
    Validation(String),
    /// Persistent store failure.
    #[error("store: {0}")]
    Store(#[from] StoreError),
    /// No key stored under the given public key.
    #[error("key not found: {0}")]
    KeyNotFound(String),
    /// No connection stored for the given application.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),
}

impl From<CryptoError> for AgentError {
    fn from(e: CryptoError) -> Self {
        Self::Crypto(e.to_string())
    }
}

impl From<SealError> for AgentError {
    fn from(e: SealError) -> Self {
        match e {
            SealError::WrongPassphrase => Self::WrongPassphrase,
            SealError::Encrypt => Self::Crypto(e.to_string()),
        }
    }
}

impl From<PairingError> for AgentError {
    fn from(e: PairingError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<nkc_common::keys::KeyDecodeError> for AgentError {
    fn from(e: nkc_common::keys::KeyDecodeError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<nkc_common::EventError> for AgentError {
    fn from(e: nkc_common::EventError) -> Self {
        Self::Crypto(e.to_string())
    }
}
