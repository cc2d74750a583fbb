//! The single consumer of the dispatch queue.
//!
//! Requests from every session are handled one at a time, in queue order,
//! so a pending permission prompt holds up all sessions.

use crate::codec::{Method, MethodCall, Response};
use crate::error::AgentError;
use crate::permission::{Outcome, PermissionGate};
use crate::session::{SessionHandle, SessionRequest};
use crate::store::Database;
use nkc_common::nip26::{self, Conditions};
use nkc_common::{keys, nip04};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Applies requests against the method catalog.
pub struct Dispatcher {
    db: Database,
    gate: PermissionGate,
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(db: Database, gate: PermissionGate) -> Self {
        Self { db, gate }
    }

    /// Drains `queue` until it closes or `cancel` fires.
    pub async fn run(&self, mut queue: mpsc::Receiver<SessionRequest>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                req = queue.recv() => match req {
                    Some(req) => self.dispatch(req).await,
                    None => break,
                },
            }
        }
        debug!("dispatcher stopped");
    }

    /// Handles one request and publishes its response, if any.
    ///
    /// Requests still queued for a session that has since ended are
    /// dropped unanswered. Malformed parameters are answered with an error
    /// before the operator is asked anything.
    pub async fn dispatch(&self, req: SessionRequest) {
        let app = keys::encode(req.session.app());
        if req.session.is_cancelled() {
            debug!(app = %app, id = %req.id, method = %req.method, "session ended, dropping request");
            return;
        }
        info!(app = %app, id = %req.id, method = %req.method, "dispatching request");

        let response = match &req.call {
            Err(e) => Some(Response::Error(e.to_string())),
            Ok(call) => match self
                .gate
                .check_allowed(req.session.connection(), req.method, describe_call(call))
                .await
            {
                Ok(Outcome::Denied) => Some(Response::Error(
                    AgentError::PermissionDenied(req.method.to_string()).to_string(),
                )),
                Ok(_) => match self.execute(&req.session, call) {
                    Ok(Some(value)) => Some(Response::Result(value)),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(app = %app, method = %req.method, error = %e, "request failed");
                        Some(Response::Error(e.to_string()))
                    }
                },
                Err(e) => Some(Response::Error(e.to_string())),
            },
        };

        if let Some(response) = response {
            if let Err(e) = req.session.respond(&req.id, &response) {
                warn!(app = %app, id = %req.id, error = %e, "could not send response");
            }
        }
    }

    /// Performs the effect of an allowed call. `None` means no response.
    fn execute(&self, session: &SessionHandle, call: &MethodCall) -> Result<Option<Value>, AgentError> {
        let signer = session.signer();
        let value = match call {
            MethodCall::Describe => Value::from(
                Method::ALL.iter().map(|m| m.name()).collect::<Vec<_>>(),
            ),
            MethodCall::GetPublicKey => Value::from(keys::encode(&signer.public_key())),
            MethodCall::SignEvent(unsigned) => {
                let signed = unsigned.clone().sign(signer)?;
                Value::from(signed.sig)
            }
            MethodCall::Disconnect => {
                self.db.remove_connection(session.app())?;
                info!(app = %keys::encode(session.app()), "disconnected by application");
                session.cancel();
                return Ok(None);
            }
            MethodCall::GetRelays => {
                let relays = self.db.relay_list(&signer.public_key())?;
                serde_json::to_value(relays).map_err(|e| AgentError::Validation(e.to_string()))?
            }
            MethodCall::Nip04Encrypt { peer, plaintext } => {
                let secret = signer.shared_secret(peer)?;
                Value::from(nip04::encrypt(&secret, plaintext))
            }
            MethodCall::Nip04Decrypt { peer, ciphertext } => {
                let secret = signer.shared_secret(peer)?;
                let plain = nip04::decrypt(&secret, ciphertext)
                    .map_err(|e| AgentError::Crypto(e.to_string()))?;
                Value::from(plain)
            }
            MethodCall::Delegate {
                delegatee,
                conditions,
            } => {
                let token = nip26::create(signer, delegatee, conditions)?;
                serde_json::to_value(token).map_err(|e| AgentError::Validation(e.to_string()))?
            }
        };
        Ok(Some(value))
    }
}

fn format_time(secs: u64) -> String {
    let readable = i64::try_from(secs)
        .ok()
        .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "out of range".to_string());
    format!("{secs} ({readable})")
}

/// Text shown to the operator alongside a permission prompt.
fn describe_call(call: &MethodCall) -> Option<String> {
    match call {
        MethodCall::SignEvent(unsigned) => serde_json::to_string_pretty(unsigned).ok(),
        MethodCall::Nip04Encrypt { peer, plaintext } => {
            Some(format!("  Encrypt to {}:\n\n{plaintext}", keys::encode(peer)))
        }
        MethodCall::Nip04Decrypt { peer, .. } => Some(format!("  Decrypt from {}", keys::encode(peer))),
        MethodCall::Delegate {
            delegatee,
            conditions: Conditions { kind, since, until },
        } => Some(format!(
            "  Delegate to {}\n  Kind: {kind}\n  Since: {}\n  Until: {}",
            keys::encode(delegatee),
            format_time(*since),
            format_time(*until)
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RequestCodec;
    use crate::connection::{AppMetadata, Connection, PairingRequest, SharedConnection};
    use crate::prompt::{Decision, ScriptedPrompt};
    use nkc_common::event::UnsignedEvent;
    use nkc_common::types::kind;
    use nkc_common::{Event, SigningKeys};
    use serde_json::json;
    use std::sync::Arc;

    struct Harness {
        db: Database,
        agent: Arc<SigningKeys>,
        app: SigningKeys,
        prompt: ScriptedPrompt,
        dispatcher: Dispatcher,
        handle: SessionHandle,
        cancel: CancellationToken,
        outbox: mpsc::UnboundedReceiver<Event>,
    }

    fn harness(decisions: Vec<Decision>) -> Harness {
        let db = Database::in_memory();
        let agent = Arc::new(SigningKeys::generate());
        let app = SigningKeys::generate();
        let req = PairingRequest {
            app: app.public_key(),
            relay: "wss://relay.example".into(),
            metadata: AppMetadata {
                name: "demo".into(),
                ..AppMetadata::default()
            },
        };
        let conn = Connection::new(&req, &agent.public_key(), Default::default());
        db.put_connection(&conn).unwrap();

        let prompt = ScriptedPrompt::new(Some("pw"), decisions);
        let gate = PermissionGate::new(db.clone(), Arc::new(prompt.clone()));
        let (tx, outbox) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = SessionHandle::new(
            app.public_key(),
            SharedConnection::new(conn),
            Arc::clone(&agent),
            Arc::new(RequestCodec::new(&agent, &app.public_key()).unwrap()),
            tx,
            cancel.clone(),
        );
        Harness {
            dispatcher: Dispatcher::new(db.clone(), gate),
            db,
            agent,
            app,
            prompt,
            handle,
            cancel,
            outbox,
        }
    }

    impl Harness {
        fn request(&self, id: &str, method: Method, params: Vec<Value>) -> SessionRequest {
            SessionRequest {
                id: id.into(),
                method,
                call: MethodCall::parse(method, &params),
                session: self.handle.clone(),
            }
        }

        fn next_response(&mut self) -> (String, Response) {
            let event = self.outbox.try_recv().expect("a response was published");
            assert!(event.verify().is_ok());
            assert_eq!(event.kind, kind::NOSTR_CONNECT);
            let codec = RequestCodec::new(&self.app, &self.agent.public_key()).unwrap();
            codec.decode_response(&event.content).unwrap()
        }
    }

    #[tokio::test]
    async fn describe_lists_catalog_without_prompting() {
        let mut h = harness(vec![]);
        h.dispatcher.dispatch(h.request("1", Method::Describe, vec![])).await;
        let (id, resp) = h.next_response();
        assert_eq!(id, "1");
        let Response::Result(Value::Array(names)) = resp else {
            panic!("expected a list");
        };
        assert_eq!(names.len(), 8);
        assert!(names.contains(&json!("get_relays")));
        assert_eq!(h.prompt.permission_asks(), 0);
    }

    #[tokio::test]
    async fn denied_request_gets_one_error_response() {
        let mut h = harness(vec![Decision::Deny]);
        h.dispatcher.dispatch(h.request("7", Method::GetPublicKey, vec![])).await;
        let (id, resp) = h.next_response();
        assert_eq!(id, "7");
        let Response::Error(msg) = resp else {
            panic!("expected an error");
        };
        assert!(msg.contains("denied"), "got {msg}");
        assert!(h.outbox.try_recv().is_err());
        assert!(!h.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn sign_event_signs_with_session_key() {
        let mut h = harness(vec![Decision::AllowAlways]);
        let params = vec![json!({"kind": 1, "created_at": 1_700_000_000u64, "tags": [], "content": "gm"})];
        h.dispatcher.dispatch(h.request("s", Method::SignEvent, params)).await;
        let (_, resp) = h.next_response();
        let Response::Result(Value::String(sig)) = resp else {
            panic!("expected a signature");
        };

        let expected = UnsignedEvent {
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "gm".into(),
        };
        let id = expected.id_for(&h.agent.public_key());
        let sig_bytes: [u8; 64] = hex::decode(&sig).unwrap().try_into().unwrap();
        assert!(nkc_common::crypto::verify(&h.agent.public_key(), &id, &sig_bytes));

        let stored = h.db.get_connection(&h.app.public_key()).unwrap().unwrap();
        assert!(stored.allows.contains("sign_event"));
    }

    #[tokio::test]
    async fn nip04_round_trip_through_third_party() {
        let mut h = harness(vec![Decision::AllowOnce, Decision::AllowOnce]);
        let friend = SigningKeys::generate();
        let friend_hex = keys::encode(&friend.public_key());

        h.dispatcher
            .dispatch(h.request("e", Method::Nip04Encrypt, vec![json!(friend_hex), json!("secret")]))
            .await;
        let (_, resp) = h.next_response();
        let Response::Result(Value::String(ciphertext)) = resp else {
            panic!("expected ciphertext");
        };
        let friend_secret = friend.shared_secret(&h.agent.public_key()).unwrap();
        assert_eq!(nip04::decrypt(&friend_secret, &ciphertext).unwrap(), "secret");

        let reply = nip04::encrypt(&friend_secret, "reply");
        h.dispatcher
            .dispatch(h.request("d", Method::Nip04Decrypt, vec![json!(friend_hex), json!(reply)]))
            .await;
        let (_, resp) = h.next_response();
        assert_eq!(resp, Response::Result(json!("reply")));
    }

    #[tokio::test]
    async fn delegate_returns_signed_token() {
        let mut h = harness(vec![Decision::AllowOnce]);
        let delegatee = keys::encode(&SigningKeys::generate().public_key());
        h.dispatcher
            .dispatch(h.request(
                "g",
                Method::Delegate,
                vec![json!(delegatee), json!({"kind": 1, "since": 100, "until": 200})],
            ))
            .await;
        let (_, resp) = h.next_response();
        let Response::Result(token) = resp else {
            panic!("expected a token");
        };
        assert_eq!(token["from"], json!(keys::encode(&h.agent.public_key())));
        assert_eq!(token["to"], json!(delegatee));
        assert_eq!(token["cond"], json!("kind=1&created_at>100&created_at<200"));
        assert_eq!(token["sig"].as_str().unwrap().len(), 128);
    }

    #[tokio::test]
    async fn bad_params_become_error_response() {
        let mut h = harness(vec![Decision::AllowOnce]);
        h.dispatcher
            .dispatch(h.request("b", Method::Nip04Encrypt, vec![json!("zz")]))
            .await;
        let (_, resp) = h.next_response();
        assert!(matches!(resp, Response::Error(_)));
        assert_eq!(h.prompt.permission_asks(), 0);
    }

    #[tokio::test]
    async fn malformed_sign_event_is_rejected_without_prompting() {
        let mut h = harness(vec![Decision::AllowAlways]);
        h.dispatcher
            .dispatch(h.request("m", Method::SignEvent, vec![json!({"kind": "one"})]))
            .await;
        let (id, resp) = h.next_response();
        assert_eq!(id, "m");
        assert!(matches!(resp, Response::Error(_)));
        assert_eq!(h.prompt.permission_asks(), 0);
        let stored = h.db.get_connection(&h.app.public_key()).unwrap().unwrap();
        assert!(stored.allows.is_empty());
    }

    #[tokio::test]
    async fn get_relays_returns_relay_map() {
        let mut h = harness(vec![Decision::AllowOnce]);
        let list = UnsignedEvent::new(
            kind::RELAY_LIST,
            vec![vec!["r".into(), "wss://a.example".into(), "read".into()]],
            "",
        )
        .sign(&h.agent)
        .unwrap();
        h.db.save_event(&list).unwrap();

        h.dispatcher.dispatch(h.request("r", Method::GetRelays, vec![])).await;
        let (_, resp) = h.next_response();
        assert_eq!(
            resp,
            Response::Result(json!({"wss://a.example": {"read": true, "write": false}}))
        );
    }

    #[tokio::test]
    async fn disconnect_removes_connection_and_cancels_session() {
        let mut h = harness(vec![]);
        h.dispatcher.dispatch(h.request("x", Method::Disconnect, vec![])).await;
        assert!(h.outbox.try_recv().is_err());
        assert!(h.cancel.is_cancelled());
        assert!(h.db.get_connection(&h.app.public_key()).unwrap().is_none());
    }

    #[tokio::test]
    async fn request_queued_behind_disconnect_is_dropped() {
        let mut h = harness(vec![Decision::AllowAlways]);
        let params = vec![json!({"kind": 1, "created_at": 1_700_000_000u64, "tags": [], "content": "gm"})];
        let (tx, rx) = mpsc::channel(10);
        tx.send(h.request("x", Method::Disconnect, vec![])).await.unwrap();
        tx.send(h.request("s", Method::SignEvent, params)).await.unwrap();
        drop(tx);

        h.dispatcher.run(rx, CancellationToken::new()).await;
        assert!(h.cancel.is_cancelled());
        assert!(h.db.get_connection(&h.app.public_key()).unwrap().is_none());
        assert_eq!(h.prompt.permission_asks(), 0);
        assert!(h.outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_processes_queue_in_order() {
        let mut h = harness(vec![]);
        let (tx, rx) = mpsc::channel(10);
        tx.send(h.request("a", Method::Describe, vec![])).await.unwrap();
        tx.send(h.request("b", Method::Describe, vec![])).await.unwrap();
        drop(tx);

        h.dispatcher.run(rx, CancellationToken::new()).await;
        assert_eq!(h.next_response().0, "a");
        assert_eq!(h.next_response().0, "b");
    }

    #[test]
    fn prompt_detail_for_delegation_shows_bounds() {
        let call = MethodCall::Delegate {
            delegatee: [1; 32],
            conditions: Conditions {
                kind: 1,
                since: 0,
                until: 86_400,
            },
        };
        let text = describe_call(&call).unwrap();
        assert!(text.contains("Kind: 1"));
        assert!(text.contains("1970-01-02 00:00:00 UTC"));
        assert!(describe_call(&MethodCall::Describe).is_none());
    }
}
