mod common;

use common::{test_config, RelayMode, TestRelay};
use nkc_common::types::kind;
use nkc_common::{crypto, SigningKeys, UnsignedEvent};
use nkcli::orchestrator::Orchestrator;
use nkcli::prompt::ScriptedPrompt;
use nkcli::store::Database;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn signed(keys: &SigningKeys, kind: u16, tags: Vec<Vec<String>>, content: &str, age: u64) -> nkc_common::Event {
    let mut ev = UnsignedEvent::new(kind, tags, content);
    ev.created_at = crypto::unix_now() - age;
    ev.sign(keys).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_merges_answers_and_abandons_silent_relays() {
    let agent = SigningKeys::generate();
    let stranger = SigningKeys::generate();

    let newest = signed(&agent, kind::METADATA, vec![], r#"{"name":"fresh"}"#, 0);
    let stale = signed(&agent, kind::METADATA, vec![], r#"{"name":"stale"}"#, 100);
    let relays_doc = signed(
        &agent,
        kind::RELAY_LIST,
        vec![
            vec!["r".into(), "wss://read.example".into(), "read".into()],
            vec!["r".into(), "wss://both.example".into()],
        ],
        "",
        10,
    );
    let noise = signed(&stranger, kind::METADATA, vec![], r#"{"name":"nope"}"#, 0);

    let a = TestRelay::start_with(RelayMode::Normal, vec![newest, noise]).await;
    let b = TestRelay::start_with(RelayMode::Normal, vec![stale, relays_doc]).await;
    let silent = TestRelay::start_silent().await;

    let db = Database::in_memory();
    nkcli::keys::store_key(&db, &agent, "pw").unwrap();
    let orch = Orchestrator::new(
        db.clone(),
        Arc::new(ScriptedPrompt::new(None, [])),
        test_config(Vec::new()),
        CancellationToken::new(),
    );

    let started = Instant::now();
    let relays = vec![a.url(), b.url(), silent.url()];
    let reports = orch.refresh(Some(relays.as_slice())).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    assert_eq!(reports.len(), 1);
    let (pubkey, report) = &reports[0];
    assert_eq!(*pubkey, agent.public_key());
    assert_eq!(report.complete, 2);
    assert_eq!(report.timed_out, 1);
    assert_eq!(report.failed, 0);

    let profile = db.profile(&agent.public_key()).unwrap().unwrap();
    assert_eq!(profile.name.as_deref(), Some("fresh"));
    let relay_map = db.relay_list(&agent.public_key()).unwrap();
    assert_eq!(relay_map.len(), 2);
    assert!(relay_map["wss://read.example"].read);
    assert!(!relay_map["wss://read.example"].write);
    assert!(relay_map["wss://both.example"].write);
    assert!(db.profile(&stranger.public_key()).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_falls_back_to_bootstrap_relays() {
    let agent = SigningKeys::generate();
    let profile = signed(&agent, kind::METADATA, vec![], r#"{"display_name":"Boot"}"#, 0);
    let boot = TestRelay::start_with(RelayMode::Normal, vec![profile]).await;

    let db = Database::in_memory();
    nkcli::keys::store_key(&db, &agent, "pw").unwrap();
    let orch = Orchestrator::new(
        db.clone(),
        Arc::new(ScriptedPrompt::new(None, [])),
        test_config(vec![boot.url()]),
        CancellationToken::new(),
    );

    let reports = orch.refresh(None).await.unwrap();
    assert_eq!(reports[0].1.complete, 1);
    assert_eq!(reports[0].1.saved, 1);
    let stored = db.profile(&agent.public_key()).unwrap().unwrap();
    assert_eq!(stored.label().as_deref(), Some("Boot"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_uses_read_relays_instead_of_bootstrap() {
    let agent = SigningKeys::generate();
    let mine = TestRelay::start().await;
    let write_only = TestRelay::start().await;
    let boot = TestRelay::start().await;

    let db = Database::in_memory();
    nkcli::keys::store_key(&db, &agent, "pw").unwrap();
    let list = signed(
        &agent,
        kind::RELAY_LIST,
        vec![
            vec!["r".into(), mine.url(), "read".into()],
            vec!["r".into(), write_only.url(), "write".into()],
        ],
        "",
        0,
    );
    db.save_event(&list).unwrap();

    let orch = Orchestrator::new(
        db.clone(),
        Arc::new(ScriptedPrompt::new(None, [])),
        test_config(vec![boot.url()]),
        CancellationToken::new(),
    );
    let reports = orch.refresh(None).await.unwrap();
    assert_eq!(reports[0].1.complete, 1);
    assert_eq!(mine.connections(), 1);
    assert_eq!(write_only.connections(), 0);
    assert_eq!(boot.connections(), 0);
}
