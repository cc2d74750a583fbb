//! Encrypted request/response envelopes and the method catalog.
//!
//! Requests travel as `{id, method, params}` and responses as
//! `{id, result}` or `{id, error}`, NIP-04 encrypted under the ECDH
//! secret shared by the agent key and the application key.

use nkc_common::event::UnsignedEvent;
use nkc_common::nip04::{self, Nip04Error};
use nkc_common::nip26::Conditions;
use nkc_common::{keys, CryptoError, Pubkey, SigningKeys};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use zeroize::Zeroizing;

/// Reasons an inbound payload is dropped without a response.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Decryption under the shared secret failed.
    #[error("decrypt: {0}")]
    Decrypt(#[from] Nip04Error),
    /// The plaintext is not a request object.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// The request has an empty method name.
    #[error("missing method")]
    MissingMethod,
}

/// A decoded request as sent by the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id echoed in the response.
    pub id: String,
    /// Method name.
    #[serde(default)]
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Success payload.
    Result(Value),
    /// Error message.
    Error(String),
}

impl Response {
    fn to_json(&self, id: &str) -> Value {
        match self {
            Self::Result(result) => serde_json::json!({ "id": id, "result": result }),
            Self::Error(error) => serde_json::json!({ "id": id, "error": error }),
        }
    }
}

/// Encrypts and decrypts envelopes for one agent/application pair.
pub struct RequestCodec {
    secret: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for RequestCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCodec").finish_non_exhaustive()
    }
}

impl RequestCodec {
    /// Derives the shared secret between `agent` and `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if `peer` is not on the curve.
    pub fn new(agent: &SigningKeys, peer: &Pubkey) -> Result<Self, CryptoError> {
        Ok(Self {
            secret: agent.shared_secret(peer)?,
        })
    }

    /// Decrypts and parses a request.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if decryption or JSON parsing fails or the
    /// method is empty.
    pub fn decode(&self, ciphertext: &str) -> Result<RequestEnvelope, CodecError> {
        let plain = nip04::decrypt(&self.secret, ciphertext)?;
        let envelope: RequestEnvelope = serde_json::from_str(&plain)?;
        if envelope.method.is_empty() {
            return Err(CodecError::MissingMethod);
        }
        Ok(envelope)
    }

    /// Encrypts a response to request `id`.
    #[must_use]
    pub fn encode(&self, response: &Response, id: &str) -> String {
        nip04::encrypt(&self.secret, &response.to_json(id).to_string())
    }

    /// Encrypts an agent-originated request such as `connect`.
    #[must_use]
    pub fn encode_request(&self, envelope: &RequestEnvelope) -> String {
        let body = serde_json::json!({
            "id": envelope.id,
            "method": envelope.method,
            "params": envelope.params,
        });
        nip04::encrypt(&self.secret, &body.to_string())
    }

    /// Decrypts a response, as the application side would.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if decryption or parsing fails.
    pub fn decode_response(&self, ciphertext: &str) -> Result<(String, Response), CodecError> {
        #[derive(Deserialize)]
        struct Raw {
            id: String,
            #[serde(default)]
            result: Option<Value>,
            #[serde(default)]
            error: Option<String>,
        }
        let raw: Raw = serde_json::from_str(&nip04::decrypt(&self.secret, ciphertext)?)?;
        let response = match raw.error {
            Some(error) => Response::Error(error),
            None => Response::Result(raw.result.unwrap_or(Value::Null)),
        };
        Ok((raw.id, response))
    }
}

/// The fixed method catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// List supported methods.
    Describe,
    /// Return the agent public key.
    GetPublicKey,
    /// Sign an event.
    SignEvent,
    /// End the connection.
    Disconnect,
    /// Return the key's relay list.
    GetRelays,
    /// NIP-04 encrypt to a third party.
    Nip04Encrypt,
    /// NIP-04 decrypt from a third party.
    Nip04Decrypt,
    /// Issue a NIP-26 delegation.
    Delegate,
}

impl Method {
    /// Every method, in the order `describe` reports them.
    pub const ALL: [Self; 8] = [
        Self::Describe,
        Self::GetPublicKey,
        Self::SignEvent,
        Self::Disconnect,
        Self::GetRelays,
        Self::Nip04Encrypt,
        Self::Nip04Decrypt,
        Self::Delegate,
    ];

    /// Wire name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Describe => "describe",
            Self::GetPublicKey => "get_public_key",
            Self::SignEvent => "sign_event",
            Self::Disconnect => "disconnect",
            Self::GetRelays => "get_relays",
            Self::Nip04Encrypt => "nip04_encrypt",
            Self::Nip04Decrypt => "nip04_decrypt",
            Self::Delegate => "delegate",
        }
    }

    /// Looks up a method by wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// `describe` and `disconnect` run without asking.
    #[must_use]
    pub const fn requires_permission(self) -> bool {
        !matches!(self, Self::Describe | Self::Disconnect)
    }

    /// Methods that can be granted.
    pub fn grantable() -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(|m| m.requires_permission())
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Bad arguments for a known method.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid params for {method}: {reason}")]
pub struct ParamError {
    /// Method the arguments were for.
    pub method: Method,
    /// What was wrong.
    pub reason: String,
}

/// A catalog method with its typed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodCall {
    /// `describe`
    Describe,
    /// `get_public_key`
    GetPublicKey,
    /// `sign_event [event]`
    SignEvent(UnsignedEvent),
    /// `disconnect`
    Disconnect,
    /// `get_relays`
    GetRelays,
    /// `nip04_encrypt [pubkey, plaintext]`
    Nip04Encrypt {
        /// Recipient.
        peer: Pubkey,
        /// Text to encrypt.
        plaintext: String,
    },
    /// `nip04_decrypt [pubkey, ciphertext]`
    Nip04Decrypt {
        /// Sender.
        peer: Pubkey,
        /// Payload to decrypt.
        ciphertext: String,
    },
    /// `delegate [pubkey, {kind, since, until}]`
    Delegate {
        /// Delegatee.
        delegatee: Pubkey,
        /// Restrictions.
        conditions: Conditions,
    },
}

impl MethodCall {
    /// Parses `params` for `method`.
    ///
    /// # Errors
    ///
    /// Returns [`ParamError`] when an argument is missing or has the wrong
    /// shape.
    pub fn parse(method: Method, params: &[Value]) -> Result<Self, ParamError> {
        let bad = |reason: &str| ParamError {
            method,
            reason: reason.to_string(),
        };
        let pubkey_at = |idx: usize| -> Result<Pubkey, ParamError> {
            let raw = params
                .get(idx)
                .and_then(Value::as_str)
                .ok_or_else(|| bad("expected a pubkey string"))?;
            keys::decode_pubkey(raw).map_err(|e| bad(&e.to_string()))
        };
        let string_at = |idx: usize| -> Result<String, ParamError> {
            params
                .get(idx)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| bad("expected a string"))
        };

        Ok(match method {
            Method::Describe => Self::Describe,
            Method::GetPublicKey => Self::GetPublicKey,
            Method::Disconnect => Self::Disconnect,
            Method::GetRelays => Self::GetRelays,
            Method::SignEvent => {
                let raw = params.first().cloned().ok_or_else(|| bad("missing event"))?;
                Self::SignEvent(serde_json::from_value(raw).map_err(|e| bad(&e.to_string()))?)
            }
            Method::Nip04Encrypt => Self::Nip04Encrypt {
                peer: pubkey_at(0)?,
                plaintext: string_at(1)?,
            },
            Method::Nip04Decrypt => Self::Nip04Decrypt {
                peer: pubkey_at(0)?,
                ciphertext: string_at(1)?,
            },
            Method::Delegate => {
                let raw = params.get(1).cloned().ok_or_else(|| bad("missing conditions"))?;
                let conditions: Conditions =
                    serde_json::from_value(raw).map_err(|e| bad(&e.to_string()))?;
                if conditions.since >= conditions.until {
                    return Err(bad("since must be before until"));
                }
                Self::Delegate {
                    delegatee: pubkey_at(0)?,
                    conditions,
                }
            }
        })
    }
}
