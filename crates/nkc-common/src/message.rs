//! Relay wire messages and subscription filters.
//!
//! Every message is a JSON array whose first element names its type.
//! Client → relay: `REQ`, `EVENT`, `CLOSE`. Relay → client: `EVENT`,
//! `EOSE`, `OK`, `NOTICE`, `CLOSED`.

use crate::event::Event;
use crate::keys;
use crate::types::Pubkey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum accepted text message size from a relay (512 KiB).
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// A subscription filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Hex event ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    /// Hex author keys.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    /// Event kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,
    /// Values of `p` tags.
    #[serde(default, rename = "#p", skip_serializing_if = "Vec::is_empty")]
    pub p_tags: Vec<String>,
    /// Lower bound on `created_at` (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    /// Upper bound on `created_at` (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    /// Maximum stored events to return before `EOSE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to the given kinds.
    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    /// Restricts to events authored by `pubkey`.
    #[must_use]
    pub fn author(mut self, pubkey: &Pubkey) -> Self {
        self.authors.push(keys::encode(pubkey));
        self
    }

    /// Restricts to events carrying a `p` tag naming `pubkey`.
    #[must_use]
    pub fn p_tag(mut self, pubkey: &Pubkey) -> Self {
        self.p_tags.push(keys::encode(pubkey));
        self
    }

    /// Sets the lower time bound.
    #[must_use]
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the result limit.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if `event` satisfies every populated field.
    ///
    /// # Examples
    ///
    /// ```
    /// use nkc_common::crypto::SigningKeys;
    /// use nkc_common::event::UnsignedEvent;
    /// use nkc_common::message::Filter;
    ///
    /// let keys = SigningKeys::generate();
    /// let ev = UnsignedEvent::new(0, vec![], "{}").sign(&keys).unwrap();
    /// assert!(Filter::new().kinds([0, 10002]).author(&keys.public_key()).matches(&ev));
    /// assert!(!Filter::new().kinds([1]).matches(&ev));
    /// ```
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        (self.ids.is_empty() || self.ids.contains(&event.id))
            && (self.authors.is_empty() || self.authors.contains(&event.pubkey))
            && (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && (self.p_tags.is_empty()
                || event.tags.iter().any(|t| {
                    t.first().map(String::as_str) == Some("p")
                        && t.get(1).is_some_and(|v| self.p_tags.contains(v))
                }))
            && self.since.map_or(true, |s| event.created_at >= s)
            && self.until.map_or(true, |u| event.created_at <= u)
    }
}

/// Errors that can occur while parsing a wire message.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Not valid JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// Not a non-empty array led by a string tag.
    #[error("message is not a tagged array")]
    NotTagged,
    /// Tag is well-formed but its arguments are missing or mistyped.
    #[error("malformed {0} message")]
    Malformed(&'static str),
    /// Unrecognized tag.
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    /// Message exceeds [`MAX_MESSAGE_SIZE`].
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
}

/// A message sent from a client to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Open a subscription.
    Req {
        /// Subscription id chosen by the client.
        sub_id: String,
        /// One or more filters, OR-ed together.
        filters: Vec<Filter>,
    },
    /// Publish an event.
    Event(Box<Event>),
    /// Close a subscription.
    Close {
        /// Subscription id.
        sub_id: String,
    },
}

/// A message sent from a relay to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// An event matching a subscription.
    Event {
        /// Subscription id.
        sub_id: String,
        /// The matching event.
        event: Box<Event>,
    },
    /// End of stored events for a subscription.
    Eose {
        /// Subscription id.
        sub_id: String,
    },
    /// Acknowledgement of a published event.
    Ok {
        /// Hex id of the published event.
        event_id: String,
        /// Whether the relay accepted it.
        accepted: bool,
        /// Human-readable reason.
        message: String,
    },
    /// Free-form notice.
    Notice(String),
    /// The relay closed a subscription.
    Closed {
        /// Subscription id.
        sub_id: String,
        /// Human-readable reason.
        message: String,
    },
}

fn split_tagged(text: &str) -> Result<(String, Vec<Value>), MessageError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(MessageError::TooLarge(text.len()));
    }
    let Value::Array(mut items) = serde_json::from_str::<Value>(text)? else {
        return Err(MessageError::NotTagged);
    };
    if items.is_empty() {
        return Err(MessageError::NotTagged);
    }
    let Value::String(tag) = items.remove(0) else {
        return Err(MessageError::NotTagged);
    };
    Ok((tag, items))
}

fn string_at(items: &[Value], idx: usize, what: &'static str) -> Result<String, MessageError> {
    items
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(MessageError::Malformed(what))
}

fn event_at(items: &mut [Value], idx: usize, what: &'static str) -> Result<Box<Event>, MessageError> {
    let raw = items
        .get_mut(idx)
        .map(Value::take)
        .ok_or(MessageError::Malformed(what))?;
    serde_json::from_value(raw)
        .map(Box::new)
        .map_err(|_| MessageError::Malformed(what))
}

impl ClientMessage {
    /// Serializes this message to its JSON text form.
    ///
    /// # Examples
    ///
    /// ```
    /// use nkc_common::message::{ClientMessage, Filter};
    /// let msg = ClientMessage::Req { sub_id: "s".into(), filters: vec![Filter::new().kinds([1])] };
    /// assert_eq!(msg.serialize(), r#"["REQ","s",{"kinds":[1]}]"#);
    /// ```
    #[must_use]
    pub fn serialize(&self) -> String {
        let value = match self {
            Self::Req { sub_id, filters } => {
                let mut arr = vec![Value::from("REQ"), Value::from(sub_id.as_str())];
                arr.extend(
                    filters
                        .iter()
                        .map(|f| serde_json::to_value(f).unwrap_or(Value::Null)),
                );
                Value::Array(arr)
            }
            Self::Event(event) => serde_json::json!(["EVENT", event]),
            Self::Close { sub_id } => serde_json::json!(["CLOSE", sub_id]),
        };
        value.to_string()
    }

    /// Parses a client message.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] for malformed or unknown messages.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let (tag, mut items) = split_tagged(text)?;
        match tag.as_str() {
            "REQ" => {
                let sub_id = string_at(&items, 0, "REQ")?;
                let filters = items
                    .drain(1..)
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<Filter>, _>>()
                    .map_err(|_| MessageError::Malformed("REQ"))?;
                Ok(Self::Req { sub_id, filters })
            }
            "EVENT" => Ok(Self::Event(event_at(&mut items, 0, "EVENT")?)),
            "CLOSE" => Ok(Self::Close {
                sub_id: string_at(&items, 0, "CLOSE")?,
            }),
            _ => Err(MessageError::UnknownType(tag)),
        }
    }
}

impl RelayMessage {
    /// Serializes this message to its JSON text form.
    #[must_use]
    pub fn serialize(&self) -> String {
        let value = match self {
            Self::Event { sub_id, event } => serde_json::json!(["EVENT", sub_id, event]),
            Self::Eose { sub_id } => serde_json::json!(["EOSE", sub_id]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => serde_json::json!(["OK", event_id, accepted, message]),
            Self::Notice(message) => serde_json::json!(["NOTICE", message]),
            Self::Closed { sub_id, message } => serde_json::json!(["CLOSED", sub_id, message]),
        };
        value.to_string()
    }

    /// Parses a relay message.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] for malformed or unknown messages.
    ///
    /// # Examples
    ///
    /// ```
    /// use nkc_common::message::RelayMessage;
    /// let msg = RelayMessage::parse(r#"["EOSE","sub1"]"#).unwrap();
    /// assert_eq!(msg, RelayMessage::Eose { sub_id: "sub1".into() });
    /// ```
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let (tag, mut items) = split_tagged(text)?;
        match tag.as_str() {
            "EVENT" => Ok(Self::Event {
                sub_id: string_at(&items, 0, "EVENT")?,
                event: event_at(&mut items, 1, "EVENT")?,
            }),
            "EOSE" => Ok(Self::Eose {
                sub_id: string_at(&items, 0, "EOSE")?,
            }),
            "OK" => Ok(Self::Ok {
                event_id: string_at(&items, 0, "OK")?,
                accepted: items
                    .get(1)
                    .and_then(Value::as_bool)
                    .ok_or(MessageError::Malformed("OK"))?,
                message: items
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            }),
            "NOTICE" => Ok(Self::Notice(string_at(&items, 0, "NOTICE")?)),
            "CLOSED" => Ok(Self::Closed {
                sub_id: string_at(&items, 0, "CLOSED")?,
                message: items
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            }),
            _ => Err(MessageError::UnknownType(tag)),
        }
    }
}
