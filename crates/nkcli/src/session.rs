//! Per-connection session engine.
//!
//! A session moves `Pending → Handshaking → Listening → Terminated`. It
//! owns one relay connection, unlocks its key on demand, publishes the
//! `connect` handshake once per connection, and forwards decoded requests
//! to the shared dispatch queue. Responses come back through a
//! [`SessionHandle`] and are published on the same relay.

use crate::codec::{Method, MethodCall, ParamError, RequestCodec, RequestEnvelope, Response};
use crate::connection::{Connection, SharedConnection};
use crate::error::AgentError;
use crate::keys::KeyRecord;
use crate::prompt::PromptGate;
use crate::relay::{self, Incoming, RelaySink, RelayStream};
use crate::store::Database;
use nkc_common::event::{self, UnsignedEvent};
use nkc_common::message::{Filter, RelayMessage};
use nkc_common::types::kind;
use nkc_common::{crypto, keys, Event, Pubkey, SigningKeys};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REQUEST_SUB: &str = "nkc-requests";
const METADATA_SUB: &str = "nkc-metadata";

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Started, handshake not done.
    Pending,
    /// Relay connected, handshake in progress.
    Handshaking,
    /// Serving requests.
    Listening,
    /// Finished. No transitions out.
    Terminated,
}

/// A decoded request waiting for the dispatcher.
#[derive(Debug)]
pub struct SessionRequest {
    /// Correlation id.
    pub id: String,
    /// Requested method.
    pub method: Method,
    /// Typed arguments, or why they could not be parsed.
    pub call: Result<MethodCall, ParamError>,
    /// The session that received it.
    pub session: SessionHandle,
}

/// Back-reference from a request to its session.
#[derive(Clone)]
pub struct SessionHandle {
    app: Pubkey,
    conn: SharedConnection,
    signer: Arc<SigningKeys>,
    codec: Arc<RequestCodec>,
    outbox: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("app", &keys::encode(&self.app))
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        app: Pubkey,
        conn: SharedConnection,
        signer: Arc<SigningKeys>,
        codec: Arc<RequestCodec>,
        outbox: mpsc::UnboundedSender<Event>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            app,
            conn,
            signer,
            codec,
            outbox,
            cancel,
        }
    }

    /// Application public key.
    #[must_use]
    pub fn app(&self) -> &Pubkey {
        &self.app
    }

    /// Agent public key.
    #[must_use]
    pub fn agent(&self) -> Pubkey {
        self.signer.public_key()
    }

    /// The session's unlocked key.
    #[must_use]
    pub fn signer(&self) -> &SigningKeys {
        &self.signer
    }

    /// The live connection record.
    #[must_use]
    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }

    /// Encrypts, signs and queues `response` for publication.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Crypto`] if signing fails or
    /// [`AgentError::Transport`] if the session has already ended.
    pub fn respond(&self, id: &str, response: &Response) -> Result<(), AgentError> {
        let content = self.codec.encode(response, id);
        let event = UnsignedEvent::new(kind::NOSTR_CONNECT, vec![event::p_tag(&self.app)], content)
            .sign(&self.signer)?;
        self.outbox
            .send(event)
            .map_err(|_| AgentError::Transport(relay::RelayError::Closed))
    }

    /// Ends the session.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once the session has been told to end.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Shared dependencies handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    /// Store handle.
    pub db: Database,
    /// Operator prompts.
    pub prompt: Arc<dyn PromptGate>,
    /// Dispatch queue.
    pub queue: mpsc::Sender<SessionRequest>,
    /// Interval between keepalive pings.
    pub keepalive: Duration,
    /// Metadata events requested on the background subscription.
    pub metadata_limit: usize,
}

struct Unlocked {
    signer: Arc<SigningKeys>,
    codec: Arc<RequestCodec>,
}

/// One running connection.
pub struct Session {
    app: Pubkey,
    agent: Pubkey,
    conn: SharedConnection,
    ctx: SessionContext,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    unlocked: Option<Unlocked>,
}

impl Session {
    /// Prepares a session for `conn`; nothing happens until [`Session::run`].
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Validation`] if the record holds malformed keys.
    pub fn new(
        conn: Connection,
        ctx: SessionContext,
        cancel: CancellationToken,
    ) -> Result<(Self, watch::Receiver<SessionState>), AgentError> {
        let app = conn.app_pubkey()?;
        let agent = conn.agent_pubkey()?;
        let (state, state_rx) = watch::channel(SessionState::Pending);
        Ok((
            Self {
                app,
                agent,
                conn: SharedConnection::new(conn),
                ctx,
                cancel,
                state,
                unlocked: None,
            },
            state_rx,
        ))
    }

    /// Runs until cancelled or a fatal error, then reports `Terminated`.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session; cancellation is `Ok`.
    pub async fn run(mut self) -> Result<(), AgentError> {
        let app = keys::encode(&self.app);
        let result = self.run_inner().await;
        match &result {
            Ok(()) => info!(app = %app, "session ended"),
            Err(e) => warn!(app = %app, error = %e, "session terminated"),
        }
        self.unlocked = None;
        self.state.send_replace(SessionState::Terminated);
        result
    }

    async fn run_inner(&mut self) -> Result<(), AgentError> {
        let snapshot = self.conn.snapshot();
        if !snapshot.acked {
            self.unlock().await?;
        }

        let connected = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            r = relay::connect(&snapshot.relay) => r?,
        };
        let (mut sink, mut stream) = connected;
        self.state.send_replace(SessionState::Handshaking);

        let result = self.serve(&mut sink, &mut stream).await;
        let _ = sink.unsubscribe(REQUEST_SUB).await;
        let _ = sink.unsubscribe(METADATA_SUB).await;
        sink.close().await;
        result
    }

    async fn serve(&mut self, sink: &mut RelaySink, stream: &mut RelayStream) -> Result<(), AgentError> {
        if let Some(connect) = self.handshake_event()? {
            sink.publish(connect).await?;
            let updated = self.conn.mark_acked();
            if !self.ctx.db.update_connection(&updated)? {
                info!(app = %updated.app_id, "connection removed during handshake");
                return Ok(());
            }
            info!(app = %updated.app_id, "handshake published");
        }

        sink.subscribe(REQUEST_SUB, vec![self.request_filter()]).await?;
        sink.subscribe(METADATA_SUB, vec![self.metadata_filter()]).await?;
        self.state.send_replace(SessionState::Listening);
        debug!(app = %keys::encode(&self.app), relay = sink.url(), "listening");

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Event>();
        let mut ping =
            tokio::time::interval_at(tokio::time::Instant::now() + self.ctx.keepalive, self.ctx.keepalive);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),

                incoming = stream.next() => match incoming? {
                    Incoming::Ping(data) => sink.pong(data).await?,
                    Incoming::Message(RelayMessage::Event { sub_id, event }) => {
                        if sub_id == REQUEST_SUB {
                            if !self.on_request(*event, &outbox_tx).await? {
                                return Ok(());
                            }
                        } else if sub_id == METADATA_SUB {
                            self.on_metadata(&event);
                        }
                    }
                    Incoming::Message(RelayMessage::Closed { sub_id, message }) => {
                        warn!(relay = sink.url(), sub_id = %sub_id, reason = %message, "subscription closed by relay");
                    }
                    Incoming::Message(other) => debug!(msg = ?other, "relay message"),
                },

                Some(event) = outbox_rx.recv() => sink.publish(event).await?,

                _ = ping.tick() => sink.ping().await?,
            }
        }
    }

    /// Builds the `connect` notification if this connection has not been
    /// acknowledged yet. `None` means the handshake is already done.
    fn handshake_event(&self) -> Result<Option<Event>, AgentError> {
        if self.conn.snapshot().acked {
            return Ok(None);
        }
        let unlocked = self
            .unlocked
            .as_ref()
            .ok_or(AgentError::WrongPassphrase)?;
        let envelope = RequestEnvelope {
            id: crypto::random_hex(8),
            method: "connect".to_string(),
            params: vec![serde_json::Value::from(keys::encode(&self.agent))],
        };
        let content = unlocked.codec.encode_request(&envelope);
        let event = UnsignedEvent::new(kind::NOSTR_CONNECT, vec![event::p_tag(&self.app)], content)
            .sign(&unlocked.signer)?;
        Ok(Some(event))
    }

    fn request_filter(&self) -> Filter {
        Filter::new()
            .kinds([kind::NOSTR_CONNECT])
            .author(&self.app)
            .p_tag(&self.agent)
            .since(crypto::unix_now())
    }

    fn metadata_filter(&self) -> Filter {
        Filter::new()
            .kinds([kind::METADATA, kind::RELAY_LIST])
            .author(&self.agent)
            .limit(self.ctx.metadata_limit)
    }

    async fn unlock(&mut self) -> Result<&Unlocked, AgentError> {
        if self.unlocked.is_none() {
            let record = KeyRecord::load(&self.ctx.db, &self.agent)?;
            let pubkey = keys::encode(&self.agent);
            let answer = tokio::select! {
                () = self.cancel.cancelled() => None,
                p = self.ctx.prompt.ask_unlock(&pubkey) => p,
            };
            let passphrase = answer.ok_or(AgentError::WrongPassphrase)?;
            let signer = record.unlock(&passphrase)?;
            let codec = RequestCodec::new(&signer, &self.app)?;
            info!(pubkey = %pubkey, "key unlocked");
            self.unlocked = Some(Unlocked {
                signer: Arc::new(signer),
                codec: Arc::new(codec),
            });
        }
        self.unlocked.as_ref().ok_or(AgentError::WrongPassphrase)
    }

    /// Handles one event on the request subscription. Returns `false` if
    /// the session was cancelled while waiting on the queue.
    async fn on_request(
        &mut self,
        event: Event,
        outbox: &mpsc::UnboundedSender<Event>,
    ) -> Result<bool, AgentError> {
        if let Err(e) = event.verify() {
            debug!(error = %e, "dropping unverifiable request event");
            return Ok(true);
        }
        if event.kind != kind::NOSTR_CONNECT
            || event.author().ok() != Some(self.app)
            || !event.tags_pubkey(&self.agent)
        {
            debug!(id = %event.id, "dropping request not addressed to this session");
            return Ok(true);
        }

        let app = self.app;
        let conn = self.conn.clone();
        let cancel = self.cancel.clone();
        let unlocked = self.unlock().await?;

        let envelope = match unlocked.codec.decode(&event.content) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "dropping undecodable request");
                return Ok(true);
            }
        };
        let Some(method) = Method::from_name(&envelope.method) else {
            debug!(method = %envelope.method, "ignoring unknown method");
            return Ok(true);
        };
        debug!(id = %envelope.id, %method, "request received");

        let request = SessionRequest {
            call: MethodCall::parse(method, &envelope.params),
            id: envelope.id,
            method,
            session: SessionHandle::new(
                app,
                conn,
                Arc::clone(&unlocked.signer),
                Arc::clone(&unlocked.codec),
                outbox.clone(),
                cancel.clone(),
            ),
        };
        tokio::select! {
            () = cancel.cancelled() => Ok(false),
            sent = self.ctx.queue.send(request) => Ok(sent.is_ok()),
        }
    }

    fn on_metadata(&self, event: &Event) {
        if event.verify().is_err() || event.author().ok() != Some(self.agent) {
            debug!(id = %event.id, "dropping metadata event");
            return;
        }
        match self.ctx.db.save_event(event) {
            Ok(true) => debug!(kind = event.kind, "metadata snapshot updated"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to store metadata event"),
        }
    }
}
