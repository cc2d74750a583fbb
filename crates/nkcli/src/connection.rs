//! Connection records and pairing URI parsing.
//!
//! A [`Connection`] is one authorized pairing between an agent key and a
//! remote application. It is persisted as JSON in the `connections`
//! partition, keyed by the application's public key.

use nkc_common::keys;
use nkc_common::types::PAIRING_SCHEME;
use nkc_common::Pubkey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Application metadata carried by the pairing URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Display name of the application.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional homepage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Set of method names a counterparty may call without prompting.
///
/// Stored as a sorted JSON array so the on-disk form is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowSet(HashSet<String>);

impl AllowSet {
    /// Returns `true` if `method` has been durably granted.
    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.0.contains(method)
    }

    /// Adds `method`; returns `false` if it was already present.
    pub fn insert(&mut self, method: &str) -> bool {
        self.0.insert(method.to_string())
    }

    /// Number of granted methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if nothing is granted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Granted method names in sorted order.
    #[must_use]
    pub fn sorted(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.0.iter().map(String::as_str).collect();
        v.sort_unstable();
        v
    }
}

impl<S: Into<String>> FromIterator<S> for AllowSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl Serialize for AllowSet {
    fn serialize<Ser: serde::Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        self.sorted().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AllowSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let list = Option::<Vec<String>>::deserialize(deserializer)?;
        Ok(list.unwrap_or_default().into_iter().collect())
    }
}

/// A stored pairing between an agent key and an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Application public key (hex).
    #[serde(rename = "appId", alias = "appid")]
    pub app_id: String,
    /// Relay the application listens on.
    pub relay: String,
    /// Agent public key serving this connection (hex).
    pub pubkey: String,
    /// Application metadata.
    #[serde(default)]
    pub metadata: AppMetadata,
    /// Durably granted methods.
    #[serde(default)]
    pub allows: AllowSet,
    /// Whether the `connect` handshake has been published.
    #[serde(default)]
    pub acked: bool,
}

impl Connection {
    /// Creates an unacknowledged connection for `agent` from a pairing request.
    #[must_use]
    pub fn new(request: &PairingRequest, agent: &Pubkey, allows: AllowSet) -> Self {
        Self {
            app_id: keys::encode(&request.app),
            relay: request.relay.clone(),
            pubkey: keys::encode(agent),
            metadata: request.metadata.clone(),
            allows,
            acked: false,
        }
    }

    /// Decodes the application public key.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored hex is malformed.
    pub fn app_pubkey(&self) -> Result<Pubkey, keys::KeyDecodeError> {
        keys::decode_pubkey(&self.app_id)
    }

    /// Decodes the agent public key.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored hex is malformed.
    pub fn agent_pubkey(&self) -> Result<Pubkey, keys::KeyDecodeError> {
        keys::decode_pubkey(&self.pubkey)
    }
}

/// A connection record shared between its session and the dispatcher.
#[derive(Debug, Clone)]
pub struct SharedConnection(Arc<RwLock<Connection>>);

impl SharedConnection {
    /// Wraps `conn`.
    #[must_use]
    pub fn new(conn: Connection) -> Self {
        Self(Arc::new(RwLock::new(conn)))
    }

    fn read(&self) -> RwLockReadGuard<'_, Connection> {
        match self.0.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("connection lock poisoned, using recovered data");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Connection> {
        match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("connection lock poisoned, using recovered data");
                poisoned.into_inner()
            }
        }
    }

    /// Copy of the current record.
    #[must_use]
    pub fn snapshot(&self) -> Connection {
        self.read().clone()
    }

    /// Returns `true` if `method` is durably granted.
    #[must_use]
    pub fn allows(&self, method: &str) -> bool {
        self.read().allows.contains(method)
    }

    /// Adds `method` to the allow-set and returns the updated record.
    pub fn grant(&self, method: &str) -> Connection {
        let mut conn = self.write();
        conn.allows.insert(method);
        conn.clone()
    }

    /// Sets the acknowledged flag and returns the updated record.
    pub fn mark_acked(&self) -> Connection {
        let mut conn = self.write();
        conn.acked = true;
        conn.clone()
    }
}

/// Errors from pairing URI parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairingError {
    /// Not a `nostrconnect://` URI.
    #[error("invalid scheme")]
    InvalidScheme,
    /// Host part is not a 64-character lowercase hex key.
    #[error("invalid pubkey")]
    InvalidPubkey,
    /// No `relay` query parameter.
    #[error("missing relay")]
    MissingRelay,
    /// No `metadata` query parameter.
    #[error("missing metadata")]
    MissingMetadata,
    /// `metadata` is not a JSON object with a `name`.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
}

/// A parsed `nostrconnect://<pubkey>?relay=<url>&metadata=<json>` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    /// Application public key.
    pub app: Pubkey,
    /// Relay address.
    pub relay: String,
    /// Application metadata.
    pub metadata: AppMetadata,
}

impl PairingRequest {
    /// Parses a pairing URI.
    ///
    /// # Errors
    ///
    /// Returns a distinct [`PairingError`] for a wrong scheme, a malformed
    /// key, a missing relay, and missing or malformed metadata.
    ///
    /// # Examples
    ///
    /// ```
    /// use nkcli::connection::{PairingError, PairingRequest};
    ///
    /// let err = PairingRequest::parse("https://example.com").unwrap_err();
    /// assert_eq!(err, PairingError::InvalidScheme);
    /// ```
    pub fn parse(uri: &str) -> Result<Self, PairingError> {
        let url = url::Url::parse(uri.trim()).map_err(|_| PairingError::InvalidScheme)?;
        if url.scheme() != PAIRING_SCHEME {
            return Err(PairingError::InvalidScheme);
        }

        let host = url.host_str().unwrap_or_default();
        if !keys::is_hex_key(host) {
            return Err(PairingError::InvalidPubkey);
        }
        let app = keys::decode_pubkey(host).map_err(|_| PairingError::InvalidPubkey)?;

        let query_value = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty())
        };

        let relay = query_value("relay").ok_or(PairingError::MissingRelay)?;
        let raw_meta = query_value("metadata").ok_or(PairingError::MissingMetadata)?;
        let metadata: AppMetadata = serde_json::from_str(&raw_meta)
            .map_err(|e| PairingError::InvalidMetadata(e.to_string()))?;

        Ok(Self {
            app,
            relay,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = "b889ff5b1513b641e2a139f661a661364979c5beee91842f8f0ef42ab558e9d4";

    fn uri(query: &str) -> String {
        format!("nostrconnect://{APP}?{query}")
    }

    #[test]
    fn parses_full_uri() {
        let req = PairingRequest::parse(&uri(
            "relay=wss%3A%2F%2Frelay.damus.io&metadata=%7B%22name%22%3A%22Demo%22%2C%22url%22%3A%22https%3A%2F%2Fdemo.app%22%7D",
        ))
        .unwrap();
        assert_eq!(keys::encode(&req.app), APP);
        assert_eq!(req.relay, "wss://relay.damus.io");
        assert_eq!(req.metadata.name, "Demo");
        assert_eq!(req.metadata.url.as_deref(), Some("https://demo.app"));
        assert_eq!(req.metadata.description, None);
    }

    #[test]
    fn wrong_scheme() {
        let bad = format!("nostr://{APP}?relay=wss://r&metadata={{}}");
        assert_eq!(PairingRequest::parse(&bad), Err(PairingError::InvalidScheme));
        assert_eq!(PairingRequest::parse("not a uri"), Err(PairingError::InvalidScheme));
    }

    #[test]
    fn bad_pubkey() {
        let short = "nostrconnect://abcd?relay=wss://r&metadata=%7B%22name%22%3A%22x%22%7D";
        assert_eq!(PairingRequest::parse(short), Err(PairingError::InvalidPubkey));
        let missing = "nostrconnect://?relay=wss://r";
        assert_eq!(PairingRequest::parse(missing), Err(PairingError::InvalidPubkey));
    }

    #[test]
    fn missing_relay() {
        let u = uri("metadata=%7B%22name%22%3A%22x%22%7D");
        assert_eq!(PairingRequest::parse(&u), Err(PairingError::MissingRelay));
        let empty = uri("relay=&metadata=%7B%22name%22%3A%22x%22%7D");
        assert_eq!(PairingRequest::parse(&empty), Err(PairingError::MissingRelay));
    }

    #[test]
    fn missing_and_malformed_metadata() {
        assert_eq!(
            PairingRequest::parse(&uri("relay=wss://r")),
            Err(PairingError::MissingMetadata)
        );
        assert!(matches!(
            PairingRequest::parse(&uri("relay=wss://r&metadata=notjson")),
            Err(PairingError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn connection_json_shape() {
        let req = PairingRequest {
            app: [1u8; 32],
            relay: "wss://r".into(),
            metadata: AppMetadata {
                name: "App".into(),
                ..AppMetadata::default()
            },
        };
        let conn = Connection::new(&req, &[2u8; 32], ["sign_event", "describe"].into_iter().collect());
        let json = serde_json::to_value(&conn).unwrap();
        assert_eq!(json["appId"], keys::encode(&[1u8; 32]));
        assert_eq!(json["allows"], serde_json::json!(["describe", "sign_event"]));
        assert_eq!(json["acked"], false);
        assert!(json["metadata"].get("url").is_none());

        let back: Connection = serde_json::from_value(json).unwrap();
        assert_eq!(back, conn);
    }

    #[test]
    fn legacy_field_names_and_null_allows_load() {
        let raw = format!(
            r#"{{"appid":"{APP}","relay":"wss://r","pubkey":"{APP}","metadata":{{"name":"x"}},"allows":null,"acked":true}}"#
        );
        let conn: Connection = serde_json::from_str(&raw).unwrap();
        assert!(conn.allows.is_empty());
        assert!(conn.acked);
        assert_eq!(keys::encode(&conn.app_pubkey().unwrap()), APP);
    }

    #[test]
    fn shared_connection_grants_are_visible_to_clones() {
        let req = PairingRequest {
            app: [1u8; 32],
            relay: "wss://r".into(),
            metadata: AppMetadata::default(),
        };
        let shared = SharedConnection::new(Connection::new(&req, &[2u8; 32], AllowSet::default()));
        let other = shared.clone();
        assert!(!other.allows("sign_event"));
        let updated = shared.grant("sign_event");
        assert!(updated.allows.contains("sign_event"));
        assert!(other.allows("sign_event"));
        assert!(other.mark_acked().acked);
        assert!(shared.snapshot().acked);
    }

    #[test]
    fn allow_set_insert_reports_novelty() {
        let mut set = AllowSet::default();
        assert!(set.insert("get_public_key"));
        assert!(!set.insert("get_public_key"));
        assert!(set.contains("get_public_key"));
        assert_eq!(set.len(), 1);
    }
}
