//! WebSocket transport to a single relay.
//!
//! [`connect`] opens the socket and splits it into a [`RelaySink`] for
//! client messages and a [`RelayStream`] yielding parsed relay messages.
//! Callers drive both halves from their own `select!` loop, answering
//! [`Incoming::Ping`] through the sink.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nkc_common::message::{ClientMessage, Filter, MessageError, RelayMessage};
use nkc_common::Event;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport failures. All of them end the session or refresh task that
/// owns the connection.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay address is not a valid WebSocket URL.
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl {
        /// Address as given.
        url: String,
        /// Parser message.
        reason: String,
    },
    /// Connecting or the opening handshake failed.
    #[error("connect to {url} failed: {source}")]
    Connect {
        /// Relay address.
        url: String,
        /// Underlying WebSocket error.
        #[source]
        source: tungstenite::Error,
    },
    /// Read or write failed on an open socket.
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// The relay closed the connection.
    #[error("connection closed by relay")]
    Closed,
}

/// Something read off the socket that the caller has to act on.
#[derive(Debug)]
pub enum Incoming {
    /// A parsed relay message.
    Message(RelayMessage),
    /// A WebSocket ping; reply with [`RelaySink::pong`].
    Ping(Vec<u8>),
}

/// Write half of a relay connection.
pub struct RelaySink {
    url: Arc<str>,
    tx: SplitSink<WsStream, Message>,
}

/// Read half of a relay connection.
pub struct RelayStream {
    url: Arc<str>,
    rx: SplitStream<WsStream>,
}

/// Opens a WebSocket connection to `url`.
///
/// # Errors
///
/// Returns [`RelayError::InvalidUrl`] or [`RelayError::Connect`].
pub async fn connect(url: &str) -> Result<(RelaySink, RelayStream), RelayError> {
    let req = url
        .into_client_request()
        .map_err(|e| RelayError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    let (ws, _) = tokio_tungstenite::connect_async(req)
        .await
        .map_err(|source| RelayError::Connect {
            url: url.to_string(),
            source,
        })?;
    debug!(relay = url, "relay connected");
    let (tx, rx) = ws.split();
    let url: Arc<str> = Arc::from(url);
    Ok((
        RelaySink {
            url: Arc::clone(&url),
            tx,
        },
        RelayStream { url, rx },
    ))
}

impl RelaySink {
    /// Relay address this sink writes to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends one client message as a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::WebSocket`] if the write fails.
    pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), RelayError> {
        self.tx.send(Message::Text(msg.serialize())).await?;
        Ok(())
    }

    /// Opens subscription `sub_id` with `filters`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::WebSocket`] if the write fails.
    pub async fn subscribe(&mut self, sub_id: &str, filters: Vec<Filter>) -> Result<(), RelayError> {
        self.send(&ClientMessage::Req {
            sub_id: sub_id.to_string(),
            filters,
        })
        .await
    }

    /// Closes subscription `sub_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::WebSocket`] if the write fails.
    pub async fn unsubscribe(&mut self, sub_id: &str) -> Result<(), RelayError> {
        self.send(&ClientMessage::Close {
            sub_id: sub_id.to_string(),
        })
        .await
    }

    /// Publishes a signed event.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::WebSocket`] if the write fails.
    pub async fn publish(&mut self, event: Event) -> Result<(), RelayError> {
        debug!(relay = %self.url, kind = event.kind, id = %event.id, "publishing event");
        self.send(&ClientMessage::Event(Box::new(event))).await
    }

    /// Sends a keepalive ping.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::WebSocket`] if the write fails.
    pub async fn ping(&mut self) -> Result<(), RelayError> {
        self.tx.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    /// Answers a relay ping.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::WebSocket`] if the write fails.
    pub async fn pong(&mut self, payload: Vec<u8>) -> Result<(), RelayError> {
        self.tx.send(Message::Pong(payload)).await?;
        Ok(())
    }

    /// Sends a close frame. Errors are ignored; the socket is going away.
    pub async fn close(&mut self) {
        let _ = self.tx.send(Message::Close(None)).await;
        let _ = self.tx.close().await;
    }
}

impl RelayStream {
    /// Relay address this stream reads from.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Waits for the next actionable frame.
    ///
    /// Unparseable text frames, pongs and binary frames are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] when the relay closes or the stream
    /// ends, and [`RelayError::WebSocket`] on a read error.
    pub async fn next(&mut self) -> Result<Incoming, RelayError> {
        loop {
            let msg = self.rx.next().await.ok_or(RelayError::Closed)??;
            match msg {
                Message::Text(text) => match RelayMessage::parse(&text) {
                    Ok(parsed) => return Ok(Incoming::Message(parsed)),
                    Err(MessageError::TooLarge(_)) => {
                        debug!(relay = %self.url, "dropping oversized relay message");
                    }
                    Err(e) => {
                        debug!(relay = %self.url, error = %e, "ignoring unparseable relay message");
                    }
                },
                Message::Ping(data) => return Ok(Incoming::Ping(data)),
                Message::Close(_) => return Err(RelayError::Closed),
                _ => {}
            }
        }
    }
}
