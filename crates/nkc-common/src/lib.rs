//! Protocol primitives shared by the remote-signing agent.
//!
//! This crate provides:
//! - Hex key encoding/decoding ([`keys`])
//! - secp256k1 Schnorr signing and ECDH ([`crypto`])
//! - The signed event format ([`event`])
//! - NIP-04 payload encryption ([`nip04`])
//! - NIP-26 delegation tokens ([`nip26`])
//! - Relay wire messages and filters ([`message`])
//! - Protocol type definitions and constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod event;
pub mod keys;
pub mod message;
pub mod nip04;
pub mod nip26;
pub mod types;

pub use crypto::{CryptoError, SigningKeys};
pub use event::{Event, EventError, UnsignedEvent};
pub use types::Pubkey;
