//! Supervises sessions and exposes the agent's entry points.
//!
//! [`Orchestrator::serve`] starts one session per stored connection, all
//! feeding one bounded queue drained by a single [`Dispatcher`]. Every
//! session gets a child of the global cancellation token, registered by
//! application key so it can be stopped on its own.

use crate::codec::{Method, RequestCodec, RequestEnvelope};
use crate::config::AgentConfig;
use crate::connection::{AllowSet, Connection, PairingRequest};
use crate::dispatcher::Dispatcher;
use crate::error::AgentError;
use crate::keys::KeyRecord;
use crate::permission::PermissionGate;
use crate::prompt::PromptGate;
use crate::refresh::{self, RefreshReport};
use crate::relay;
use crate::session::{Session, SessionContext, SessionState};
use crate::store::Database;
use dashmap::DashMap;
use nkc_common::event::{self, UnsignedEvent};
use nkc_common::types::kind;
use nkc_common::{crypto, keys, Pubkey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct SessionEntry {
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    agent: Pubkey,
}

/// Owns the session registry and the shared collaborators.
pub struct Orchestrator {
    db: Database,
    prompt: Arc<dyn PromptGate>,
    config: AgentConfig,
    cancel: CancellationToken,
    sessions: DashMap<Pubkey, SessionEntry>,
}

impl Orchestrator {
    /// Creates an orchestrator. Cancelling `cancel` stops everything it runs.
    #[must_use]
    pub fn new(
        db: Database,
        prompt: Arc<dyn PromptGate>,
        config: AgentConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            prompt,
            config,
            cancel,
            sessions: DashMap::new(),
        }
    }

    /// The store handle.
    #[must_use]
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Serves every stored connection until all sessions have terminated.
    ///
    /// Returns the number of sessions started.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Store`] or [`AgentError::Validation`] if the
    /// stored connections cannot be enumerated; nothing is started then.
    pub async fn serve(&self) -> Result<usize, AgentError> {
        let conns = self.db.list_connections()?;
        if conns.is_empty() {
            info!("no stored connections");
            return Ok(0);
        }

        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        let ctx = SessionContext {
            db: self.db.clone(),
            prompt: Arc::clone(&self.prompt),
            queue: queue_tx,
            keepalive: Duration::from_secs(self.config.keepalive.interval_s),
            metadata_limit: self.config.refresh.limit,
        };

        let mut prepared = Vec::with_capacity(conns.len());
        for conn in conns {
            let app = conn.app_pubkey()?;
            let agent = conn.agent_pubkey()?;
            let token = self.cancel.child_token();
            let (session, state) = Session::new(conn, ctx.clone(), token.clone())?;
            prepared.push((app, agent, session, token, state));
        }
        drop(ctx);

        let dispatcher = Dispatcher::new(
            self.db.clone(),
            PermissionGate::new(self.db.clone(), Arc::clone(&self.prompt)),
        );
        let dispatcher_cancel = self.cancel.child_token();
        let dispatcher_task = {
            let cancel = dispatcher_cancel.clone();
            tokio::spawn(async move { dispatcher.run(queue_rx, cancel).await })
        };

        let started = prepared.len();
        info!(sessions = started, "serving connections");
        let mut tasks = JoinSet::new();
        for (app, agent, session, cancel, state) in prepared {
            self.sessions.insert(app, SessionEntry { cancel, state, agent });
            tasks.spawn(async move { (app, session.run().await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((app, Ok(()))) => info!(app = %keys::encode(&app), "session finished"),
                Ok((app, Err(e))) => warn!(app = %keys::encode(&app), error = %e, "session failed"),
                Err(e) => error!(error = %e, "session task panicked"),
            }
        }

        dispatcher_cancel.cancel();
        dispatcher_task.abort();
        let _ = dispatcher_task.await;
        info!("all sessions terminated");
        Ok(started)
    }

    /// Current state of the session for `app`, if one was started.
    #[must_use]
    pub fn session_state(&self, app: &Pubkey) -> Option<SessionState> {
        self.sessions.get(app).map(|entry| *entry.state.borrow())
    }

    /// A receiver for state changes of the session for `app`.
    #[must_use]
    pub fn watch_session(&self, app: &Pubkey) -> Option<watch::Receiver<SessionState>> {
        self.sessions.get(app).map(|entry| entry.state.clone())
    }

    /// Cancels the session for `app`. Returns `false` if none is registered.
    pub fn stop_session(&self, app: &Pubkey) -> bool {
        match self.sessions.get(app) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stores a new connection from a pairing request, served by `agent`.
    /// With `allow_all` every permission-bearing method is pre-granted.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::KeyNotFound`] if `agent` is not stored.
    pub fn add_connection(
        &self,
        request: &PairingRequest,
        agent: &Pubkey,
        allow_all: bool,
    ) -> Result<Connection, AgentError> {
        if !self.db.has_key(agent)? {
            return Err(AgentError::KeyNotFound(keys::encode(agent)));
        }
        let allows: AllowSet = if allow_all {
            Method::grantable().map(Method::name).collect()
        } else {
            AllowSet::default()
        };
        let conn = Connection::new(request, agent, allows);
        self.db.put_connection(&conn)?;
        info!(app = %conn.app_id, agent = %conn.pubkey, "connection stored");
        Ok(conn)
    }

    /// Tells the application behind `app` that the connection is over,
    /// then removes it and stops its session.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ConnectionNotFound`], an unlock failure, or a
    /// transport error. The connection is only removed once the
    /// notification is published.
    pub async fn disconnect(&self, app: &Pubkey) -> Result<(), AgentError> {
        let conn = self
            .db
            .get_connection(app)?
            .ok_or_else(|| AgentError::ConnectionNotFound(keys::encode(app)))?;
        let agent = conn.agent_pubkey()?;
        let record = KeyRecord::load(&self.db, &agent)?;
        let passphrase = self
            .prompt
            .ask_unlock(&conn.pubkey)
            .await
            .ok_or(AgentError::WrongPassphrase)?;
        let signer = record.unlock(&passphrase)?;
        let codec = RequestCodec::new(&signer, app)?;

        let notice = RequestEnvelope {
            id: crypto::random_hex(16),
            method: Method::Disconnect.name().to_string(),
            params: Vec::new(),
        };
        let event = UnsignedEvent::new(
            kind::NOSTR_CONNECT,
            vec![event::p_tag(app)],
            codec.encode_request(&notice),
        )
        .sign(&signer)?;

        let (mut sink, _stream) = relay::connect(&conn.relay).await?;
        let published = sink.publish(event).await;
        sink.close().await;
        published?;

        self.db.remove_connection(app)?;
        self.stop_session(app);
        info!(app = %conn.app_id, "connection removed");
        Ok(())
    }

    /// Removes a key, every connection it serves, and stops their sessions.
    /// Returns the number of connections removed.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::KeyNotFound`] if nothing is stored for `pubkey`.
    pub fn remove_key(&self, pubkey: &Pubkey) -> Result<usize, AgentError> {
        if !self.db.has_key(pubkey)? {
            return Err(AgentError::KeyNotFound(keys::encode(pubkey)));
        }
        let removed = self.db.remove_key(pubkey)?;
        for entry in &self.sessions {
            if entry.agent == *pubkey {
                entry.cancel.cancel();
            }
        }
        Ok(removed)
    }

    /// Refreshes profile and relay-list snapshots for every stored key.
    /// `relays` replaces the per-key candidates when given.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Store`] if the keys cannot be listed.
    pub async fn refresh(
        &self,
        relays: Option<&[String]>,
    ) -> Result<Vec<(Pubkey, RefreshReport)>, AgentError> {
        let pubkeys: Vec<Pubkey> = self.db.list_keys()?.into_iter().map(|k| k.pubkey).collect();
        self.refresh_some(&pubkeys, relays).await
    }

    /// Refreshes snapshots for `pubkeys` only.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible to match [`Orchestrator::refresh`].
    pub async fn refresh_some(
        &self,
        pubkeys: &[Pubkey],
        relays: Option<&[String]>,
    ) -> Result<Vec<(Pubkey, RefreshReport)>, AgentError> {
        let scope = self.cancel.child_token();
        Ok(refresh::refresh_keys(
            &self.db,
            pubkeys,
            relays,
            &self.config.relays,
            &self.config.refresh,
            &scope,
        )
        .await)
    }
}
