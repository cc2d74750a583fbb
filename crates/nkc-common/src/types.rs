//! Core type definitions and protocol constants.

/// A 32-byte x-only secp256k1 public key identifying an agent or application.
pub type Pubkey = [u8; 32];

/// A 32-byte event id (SHA-256 of the canonical event serialization).
pub type EventId = [u8; 32];

/// Event kinds understood by the agent.
pub mod kind {
    /// Profile metadata document (`display_name`, `name`, `nip05`, ...).
    pub const METADATA: u16 = 0;
    /// Relay list document (NIP-65).
    pub const RELAY_LIST: u16 = 10_002;
    /// Remote-signing request/response envelope (NIP-46).
    pub const NOSTR_CONNECT: u16 = 24_133;
}

/// Pairing URI scheme used by applications requesting a remote signer.
pub const PAIRING_SCHEME: &str = "nostrconnect";
