//! nkcli: key custody and remote signing over Nostr relays.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Request envelopes, method catalog and typed parameters.
pub mod codec;
/// CLI parsing and TOML configuration.
pub mod config;
/// Connection records and pairing URIs.
pub mod connection;
/// Single consumer of the shared request queue.
pub mod dispatcher;
/// Agent error taxonomy.
pub mod error;
/// Stored key records and unlocking.
pub mod keys;
/// Session supervision and the agent's entry points.
pub mod orchestrator;
/// Per-connection permission checks.
pub mod permission;
/// Operator prompts: passphrases and permission decisions.
pub mod prompt;
/// Profile and relay-list refresh across relays.
pub mod refresh;
/// WebSocket relay transport.
pub mod relay;
/// Passphrase sealing of private keys at rest.
pub mod seal;
/// Per-connection session engine.
pub mod session;
/// Partitioned key-value storage.
pub mod store;

pub use error::AgentError;
