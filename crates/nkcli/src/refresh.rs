//! Profile and relay-list refresh across several relays.
//!
//! Each candidate relay is queried in its own task; matching events flow
//! through one channel into a single aggregator that overwrites the
//! stored snapshots. A relay that fails to connect is skipped. One that
//! never answers is abandoned after the per-relay timeout.

use crate::config::RefreshConfig;
use crate::relay::{self, Incoming, RelayError};
use crate::store::{Database, RelayMap};
use nkc_common::message::{Filter, RelayMessage};
use nkc_common::types::kind;
use nkc_common::{crypto, keys, Event, Pubkey};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How one relay's query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The relay signalled end of stored events.
    Complete,
    /// The per-relay timeout elapsed first.
    TimedOut,
    /// The refresh was cancelled.
    Cancelled,
    /// Connecting or reading failed.
    Failed,
}

/// Summary of one refresh call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Relays that reached end of stored events.
    pub complete: usize,
    /// Relays abandoned at the timeout.
    pub timed_out: usize,
    /// Relays that could not be queried.
    pub failed: usize,
    /// Snapshots written.
    pub saved: usize,
}

impl RefreshReport {
    fn record(&mut self, outcome: RelayOutcome) {
        match outcome {
            RelayOutcome::Complete => self.complete += 1,
            RelayOutcome::TimedOut => self.timed_out += 1,
            RelayOutcome::Failed => self.failed += 1,
            RelayOutcome::Cancelled => {}
        }
    }
}

/// Relays to query for `known`: its read relays, or `bootstrap` when it
/// has none.
#[must_use]
pub fn candidate_relays(known: &RelayMap, bootstrap: &[String]) -> Vec<String> {
    let read: Vec<String> = known
        .iter()
        .filter(|(_, attr)| attr.read)
        .map(|(url, _)| url.clone())
        .collect();
    if read.is_empty() {
        bootstrap.to_vec()
    } else {
        read
    }
}

/// Queries `relays` for `pubkey`'s profile and relay list and stores the
/// newest of each.
///
/// Returns once every relay task has finished.
pub async fn refresh_key(
    db: &Database,
    pubkey: &Pubkey,
    relays: &[String],
    config: &RefreshConfig,
    cancel: &CancellationToken,
) -> RefreshReport {
    let scope = cancel.child_token();
    let filter = Filter::new()
        .kinds([kind::METADATA, kind::RELAY_LIST])
        .author(pubkey)
        .limit(config.limit);
    let timeout = Duration::from_millis(config.timeout_ms);
    let unique: BTreeSet<&String> = relays.iter().collect();

    let (tx, rx) = mpsc::channel::<Event>(unique.len().max(1) * config.limit.max(1));
    let aggregator = tokio::spawn(aggregate(db.clone(), *pubkey, rx, scope.clone()));

    let mut tasks = JoinSet::new();
    for url in unique {
        let url = url.clone();
        let filter = filter.clone();
        let tx = tx.clone();
        let scope = scope.clone();
        tasks.spawn(async move {
            let outcome = query_relay(&url, filter, tx, timeout, &scope).await;
            (url, outcome)
        });
    }
    drop(tx);

    let mut report = RefreshReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((url, Ok(outcome))) => {
                debug!(relay = %url, ?outcome, "relay query finished");
                if outcome == RelayOutcome::TimedOut {
                    info!(relay = %url, "relay timed out");
                }
                report.record(outcome);
            }
            Ok((url, Err(e))) => {
                warn!(relay = %url, error = %e, "relay skipped");
                report.record(RelayOutcome::Failed);
            }
            Err(e) => {
                warn!(error = %e, "relay task panicked");
                report.record(RelayOutcome::Failed);
            }
        }
    }

    scope.cancel();
    report.saved = aggregator.await.unwrap_or_default();
    report
}

/// Refreshes every key concurrently. Each key uses its own read relays, or
/// `bootstrap` when it has none, unless `relays` overrides both.
pub async fn refresh_keys(
    db: &Database,
    pubkeys: &[Pubkey],
    relays: Option<&[String]>,
    bootstrap: &[String],
    config: &RefreshConfig,
    cancel: &CancellationToken,
) -> Vec<(Pubkey, RefreshReport)> {
    let mut tasks = JoinSet::new();
    for pubkey in pubkeys {
        let candidates = match relays {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => match db.relay_list(pubkey) {
                Ok(known) => candidate_relays(&known, bootstrap),
                Err(e) => {
                    warn!(pubkey = %keys::encode(pubkey), error = %e, "unreadable relay list");
                    bootstrap.to_vec()
                }
            },
        };
        let db = db.clone();
        let pubkey = *pubkey;
        let config = config.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let report = refresh_key(&db, &pubkey, &candidates, &config, &cancel).await;
            (pubkey, report)
        });
    }

    let mut reports = Vec::with_capacity(pubkeys.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(done) => reports.push(done),
            Err(e) => warn!(error = %e, "refresh task panicked"),
        }
    }
    reports
}

async fn query_relay(
    url: &str,
    filter: Filter,
    tx: mpsc::Sender<Event>,
    timeout: Duration,
    scope: &CancellationToken,
) -> Result<RelayOutcome, RelayError> {
    let sub_id = format!("refresh-{}", crypto::random_hex(4));
    let work = async {
        let (mut sink, mut stream) = relay::connect(url).await?;
        sink.subscribe(&sub_id, vec![filter]).await?;
        let result = loop {
            match stream.next().await {
                Ok(Incoming::Message(RelayMessage::Event { sub_id: sid, event })) if sid == sub_id => {
                    if tx.send(*event).await.is_err() {
                        break Ok(RelayOutcome::Cancelled);
                    }
                }
                Ok(Incoming::Message(RelayMessage::Eose { sub_id: sid })) if sid == sub_id => {
                    break Ok(RelayOutcome::Complete);
                }
                Ok(Incoming::Message(RelayMessage::Closed { sub_id: sid, message })) if sid == sub_id => {
                    debug!(relay = url, reason = %message, "subscription refused");
                    break Ok(RelayOutcome::Complete);
                }
                Ok(Incoming::Ping(data)) => sink.pong(data).await?,
                Ok(Incoming::Message(_)) => {}
                Err(e) => break Err(e),
            }
        };
        let _ = sink.unsubscribe(&sub_id).await;
        sink.close().await;
        result
    };

    tokio::select! {
        biased;
        () = scope.cancelled() => Ok(RelayOutcome::Cancelled),
        r = tokio::time::timeout(timeout, work) => r.unwrap_or(Ok(RelayOutcome::TimedOut)),
    }
}

/// Drains `rx` into the store until the channel closes or `scope` is
/// cancelled. Returns the number of snapshots written.
async fn aggregate(
    db: Database,
    pubkey: Pubkey,
    mut rx: mpsc::Receiver<Event>,
    scope: CancellationToken,
) -> usize {
    let mut saved = 0;
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => {
                let Some(event) = event else { break };
                if event.verify().is_err() || event.author().ok() != Some(pubkey) {
                    debug!(id = %event.id, "dropping unverifiable refresh event");
                    continue;
                }
                match db.save_event(&event) {
                    Ok(true) => {
                        info!(pubkey = %event.pubkey, kind = event.kind, "snapshot updated");
                        saved += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "failed to store refresh event"),
                }
            }
            () = scope.cancelled() => break,
        }
    }
    saved
}
