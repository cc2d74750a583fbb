#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use nkc_common::event::{self, UnsignedEvent};
use nkc_common::message::{ClientMessage, Filter, RelayMessage};
use nkc_common::types::kind;
use nkc_common::{crypto, Event, Pubkey, SigningKeys};
use nkcli::codec::{RequestCodec, RequestEnvelope, Response};
use nkcli::config::{AgentConfig, KeepaliveConfig, RefreshConfig};
use nkcli::connection::{AllowSet, AppMetadata, Connection, PairingRequest};
use nkcli::orchestrator::Orchestrator;
use nkcli::prompt::{Decision, PermissionRequest, PromptGate};
use nkcli::relay::{self, Incoming, RelaySink, RelayStream};
use nkcli::session::SessionState;
use nkcli::store::Database;
use nkcli::AgentError;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

/// How the in-process relay behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Stores, matches and forwards events.
    Normal,
    /// Accepts connections and reads everything but never answers.
    Silent,
}

#[derive(Default)]
struct RelayState {
    stored: Mutex<Vec<Event>>,
    published: Mutex<Vec<Event>>,
    connections: Mutex<usize>,
}

/// A minimal relay speaking REQ/EVENT/EOSE/CLOSE on 127.0.0.1.
pub struct TestRelay {
    pub addr: SocketAddr,
    state: Arc<RelayState>,
    handle: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start() -> Self {
        Self::start_with(RelayMode::Normal, Vec::new()).await
    }

    pub async fn start_silent() -> Self {
        Self::start_with(RelayMode::Silent, Vec::new()).await
    }

    pub async fn start_with(mode: RelayMode, preloaded: Vec<Event>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RelayState::default());
        state.stored.lock().unwrap().extend(preloaded);
        let (live_tx, _) = broadcast::channel::<Event>(256);

        let handle = tokio::spawn({
            let state = state.clone();
            async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    *state.connections.lock().unwrap() += 1;
                    let state = state.clone();
                    let live_tx = live_tx.clone();
                    tokio::spawn(async move {
                        let _ = serve_client(tcp, mode, state, live_tx).await;
                    });
                }
            }
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Every event clients published, in arrival order.
    pub fn published(&self) -> Vec<Event> {
        self.state.published.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        *self.state.connections.lock().unwrap()
    }

    /// Polls until a published event satisfies `pred`.
    pub async fn wait_for_published(&self, pred: impl Fn(&Event) -> bool) -> Event {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(ev) = self.published().into_iter().find(|e| pred(e)) {
                    return ev;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timeout waiting for published event")
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_client(
    tcp: TcpStream,
    mode: RelayMode,
    state: Arc<RelayState>,
    live_tx: broadcast::Sender<Event>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(tcp).await?;
    let (mut tx, mut rx) = ws.split();
    let mut live_rx = live_tx.subscribe();
    let mut subs: HashMap<String, Vec<Filter>> = HashMap::new();

    loop {
        tokio::select! {
            msg = rx.next() => {
                let Some(msg) = msg else { return Ok(()) };
                let Message::Text(text) = msg? else { continue };
                if mode == RelayMode::Silent {
                    continue;
                }
                match ClientMessage::parse(&text) {
                    Ok(ClientMessage::Req { sub_id, filters }) => {
                        let stored = state.stored.lock().unwrap().clone();
                        for ev in stored.into_iter().filter(|e| filters.iter().any(|f| f.matches(e))) {
                            let out = RelayMessage::Event { sub_id: sub_id.clone(), event: Box::new(ev) };
                            tx.send(Message::Text(out.serialize())).await?;
                        }
                        tx.send(Message::Text(RelayMessage::Eose { sub_id: sub_id.clone() }.serialize())).await?;
                        subs.insert(sub_id, filters);
                    }
                    Ok(ClientMessage::Event(ev)) => {
                        let ev = *ev;
                        let ok = RelayMessage::Ok {
                            event_id: ev.id.clone(),
                            accepted: true,
                            message: String::new(),
                        };
                        state.stored.lock().unwrap().push(ev.clone());
                        state.published.lock().unwrap().push(ev.clone());
                        let _ = live_tx.send(ev);
                        tx.send(Message::Text(ok.serialize())).await?;
                    }
                    Ok(ClientMessage::Close { sub_id }) => {
                        subs.remove(&sub_id);
                    }
                    Err(_) => {
                        tx.send(Message::Text(RelayMessage::Notice("bad message".into()).serialize())).await?;
                    }
                }
            }
            live = live_rx.recv() => {
                let Ok(ev) = live else { continue };
                for (sub_id, filters) in &subs {
                    if filters.iter().any(|f| f.matches(&ev)) {
                        let out = RelayMessage::Event { sub_id: sub_id.clone(), event: Box::new(ev.clone()) };
                        tx.send(Message::Text(out.serialize())).await?;
                    }
                }
            }
        }
    }
}

/// What an application receives from the agent.
#[derive(Debug)]
pub enum AgentMessage {
    /// An agent-originated request (`connect`, `disconnect`).
    Request(RequestEnvelope),
    /// A response to one of our requests.
    Response(String, Response),
}

/// Plays the application side of a pairing.
pub struct AppClient {
    pub keys: SigningKeys,
    agent: Pubkey,
    codec: RequestCodec,
    sink: RelaySink,
    stream: RelayStream,
}

impl AppClient {
    pub async fn connect(url: &str, keys: SigningKeys, agent: Pubkey) -> Self {
        let (mut sink, stream) = relay::connect(url).await.unwrap();
        let codec = RequestCodec::new(&keys, &agent).unwrap();
        let filter = Filter::new()
            .kinds([kind::NOSTR_CONNECT])
            .author(&agent)
            .p_tag(&keys.public_key());
        sink.subscribe("app", vec![filter]).await.unwrap();
        Self {
            keys,
            agent,
            codec,
            sink,
            stream,
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keys.public_key()
    }

    /// Publishes a request and returns its id.
    pub async fn send(&mut self, method: &str, params: Vec<Value>) -> String {
        let id = crypto::random_hex(8);
        let content = self.codec.encode_request(&RequestEnvelope {
            id: id.clone(),
            method: method.to_string(),
            params,
        });
        let ev = UnsignedEvent::new(kind::NOSTR_CONNECT, vec![event::p_tag(&self.agent)], content)
            .sign(&self.keys)
            .unwrap();
        self.sink.publish(ev).await.unwrap();
        id
    }

    /// Next message from the agent, or `None` if nothing arrives in `wait`.
    pub async fn recv(&mut self, wait: Duration) -> Option<AgentMessage> {
        tokio::time::timeout(wait, async {
            loop {
                match self.stream.next().await {
                    Ok(Incoming::Message(RelayMessage::Event { sub_id, event })) if sub_id == "app" => {
                        if let Ok(req) = self.codec.decode(&event.content) {
                            return Some(AgentMessage::Request(req));
                        }
                        if let Ok((id, resp)) = self.codec.decode_response(&event.content) {
                            return Some(AgentMessage::Response(id, resp));
                        }
                    }
                    Ok(Incoming::Ping(data)) => {
                        let _ = self.sink.pong(data).await;
                    }
                    Ok(_) => {}
                    Err(_) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Waits for the response to request `id`, skipping anything else.
    pub async fn response_to(&mut self, id: &str) -> Response {
        loop {
            match self.recv(Duration::from_secs(5)).await {
                Some(AgentMessage::Response(rid, resp)) if rid == id => return resp,
                Some(_) => {}
                None => panic!("no response to {id}"),
            }
        }
    }

    /// Sends `method` and waits for its response.
    pub async fn call(&mut self, method: &str, params: Vec<Value>) -> Response {
        let id = self.send(method, params).await;
        self.response_to(&id).await
    }
}

/// Config tuned for tests: short refresh timeout, no keepalive noise.
pub fn test_config(relays: Vec<String>) -> AgentConfig {
    AgentConfig {
        db: std::env::temp_dir().join("nkcli-test-unused"),
        relays,
        queue_capacity: 10,
        refresh: RefreshConfig {
            timeout_ms: 500,
            limit: 2,
        },
        keepalive: KeepaliveConfig { interval_s: 60 },
    }
}

/// Stores a fresh agent key under `passphrase` and a connection to `app`
/// served on `relay_url`.
pub fn seed(db: &Database, passphrase: &str, app: &Pubkey, relay_url: &str, acked: bool) -> SigningKeys {
    let agent = SigningKeys::generate();
    nkcli::keys::store_key(db, &agent, passphrase).unwrap();
    let req = PairingRequest {
        app: *app,
        relay: relay_url.to_string(),
        metadata: AppMetadata {
            name: "test-app".into(),
            ..AppMetadata::default()
        },
    };
    let mut conn = Connection::new(&req, &agent.public_key(), AllowSet::default());
    conn.acked = acked;
    db.put_connection(&conn).unwrap();
    agent
}

/// Unlocks with a fixed passphrase and holds each permission prompt open
/// until [`GatedPrompt::release`] is called, then allows once.
#[derive(Clone)]
pub struct GatedPrompt {
    inner: Arc<GateState>,
}

struct GateState {
    passphrase: String,
    asked: Notify,
    release: Notify,
    asks: AtomicUsize,
}

impl GatedPrompt {
    pub fn new(passphrase: &str) -> Self {
        Self {
            inner: Arc::new(GateState {
                passphrase: passphrase.to_string(),
                asked: Notify::new(),
                release: Notify::new(),
                asks: AtomicUsize::new(0),
            }),
        }
    }

    /// Waits until a permission prompt is open.
    pub async fn wait_until_asked(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.inner.asked.notified())
            .await
            .expect("no permission prompt was opened");
    }

    /// Answers the open prompt, or the next one.
    pub fn release(&self) {
        self.inner.release.notify_one();
    }

    pub fn permission_asks(&self) -> usize {
        self.inner.asks.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PromptGate for GatedPrompt {
    async fn ask_unlock(&self, _pubkey: &str) -> Option<Zeroizing<String>> {
        Some(Zeroizing::new(self.inner.passphrase.clone()))
    }

    async fn ask_permission(&self, _request: &PermissionRequest) -> Decision {
        self.inner.asks.fetch_add(1, Ordering::SeqCst);
        self.inner.asked.notify_one();
        self.inner.release.notified().await;
        Decision::AllowOnce
    }
}

/// Runs `serve` on a spawned task.
pub fn serve_in_background(
    db: &Database,
    prompt: Arc<dyn PromptGate>,
) -> (Arc<Orchestrator>, CancellationToken, JoinHandle<Result<usize, AgentError>>) {
    let cancel = CancellationToken::new();
    let orch = Arc::new(Orchestrator::new(
        db.clone(),
        prompt,
        test_config(Vec::new()),
        cancel.clone(),
    ));
    let serving = tokio::spawn({
        let orch = orch.clone();
        async move { orch.serve().await }
    });
    (orch, cancel, serving)
}

/// Waits for `app`'s session to register and reach `want`.
pub async fn wait_for_state(orch: &Orchestrator, app: &Pubkey, want: SessionState) {
    let mut rx = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(rx) = orch.watch_session(app) {
                return rx;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never registered");
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .expect("timeout waiting for session state")
        .expect("state channel closed");
}
