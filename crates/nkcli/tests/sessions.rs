mod common;

use common::{seed, serve_in_background, wait_for_state, AppClient, GatedPrompt, TestRelay};
use nkc_common::{keys, SigningKeys};
use nkcli::codec::Response;
use nkcli::prompt::ScriptedPrompt;
use nkcli::session::SessionState;
use nkcli::store::Database;
use std::sync::Arc;
use std::time::Duration;

struct Paired {
    client: AppClient,
    agent: SigningKeys,
}

/// Seeds an acknowledged connection for a fresh app and connects its client.
async fn pair(db: &Database, relay: &TestRelay) -> Paired {
    let app_keys = SigningKeys::generate();
    let agent = seed(db, "pw", &app_keys.public_key(), &relay.url(), true);
    let client = AppClient::connect(&relay.url(), app_keys, agent.public_key()).await;
    Paired { client, agent }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sibling_session_keeps_serving_after_app_disconnects() {
    let relay = TestRelay::start().await;
    let db = Database::in_memory();
    let mut leaving = pair(&db, &relay).await;
    let mut staying = pair(&db, &relay).await;
    let (leaving_app, staying_app) = (leaving.client.pubkey(), staying.client.pubkey());

    let (orch, cancel, serving) = serve_in_background(&db, Arc::new(ScriptedPrompt::new(Some("pw"), [])));
    wait_for_state(&orch, &leaving_app, SessionState::Listening).await;
    wait_for_state(&orch, &staying_app, SessionState::Listening).await;

    leaving.client.send("disconnect", vec![]).await;
    wait_for_state(&orch, &leaving_app, SessionState::Terminated).await;
    assert!(db.get_connection(&leaving_app).unwrap().is_none());

    assert_eq!(orch.session_state(&staying_app), Some(SessionState::Listening));
    match staying.client.call("describe", vec![]).await {
        Response::Result(v) => assert!(v.as_array().is_some_and(|m| !m.is_empty())),
        Response::Error(e) => panic!("describe failed: {e}"),
    }
    assert!(db.get_connection(&staying_app).unwrap().is_some());
    assert!(!serving.is_finished());

    cancel.cancel();
    let served = tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("serve did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(served, 2);
    assert_eq!(orch.session_state(&staying_app), Some(SessionState::Terminated));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_serve_terminates_every_session() {
    let relay = TestRelay::start().await;
    let db = Database::in_memory();
    let mut apps = Vec::new();
    for _ in 0..3 {
        apps.push(pair(&db, &relay).await);
    }

    let (orch, cancel, serving) = serve_in_background(&db, Arc::new(ScriptedPrompt::new(Some("pw"), [])));
    for paired in &apps {
        wait_for_state(&orch, &paired.client.pubkey(), SessionState::Listening).await;
    }

    cancel.cancel();
    for paired in &apps {
        wait_for_state(&orch, &paired.client.pubkey(), SessionState::Terminated).await;
    }
    let served = tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("serve did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(served, 3);
    for paired in &apps {
        assert!(db.get_connection(&paired.client.pubkey()).unwrap().is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_prompt_holds_back_other_sessions() {
    let relay = TestRelay::start().await;
    let db = Database::in_memory();
    let mut first = pair(&db, &relay).await;
    let mut second = pair(&db, &relay).await;

    let prompt = GatedPrompt::new("pw");
    let (orch, cancel, serving) = serve_in_background(&db, Arc::new(prompt.clone()));
    wait_for_state(&orch, &first.client.pubkey(), SessionState::Listening).await;
    wait_for_state(&orch, &second.client.pubkey(), SessionState::Listening).await;

    let gated = first.client.send("get_public_key", vec![]).await;
    prompt.wait_until_asked().await;
    let queued = second.client.send("describe", vec![]).await;

    assert!(
        second.client.recv(Duration::from_millis(400)).await.is_none(),
        "second session was answered while a prompt was open"
    );

    prompt.release();
    assert_eq!(
        first.client.response_to(&gated).await,
        Response::Result(keys::encode(&first.agent.public_key()).into())
    );
    assert!(matches!(
        second.client.response_to(&queued).await,
        Response::Result(_)
    ));
    assert_eq!(prompt.permission_asks(), 1);

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), serving).await;
}
