#![forbid(unsafe_code)]

use nkcli::config::{load_config, AgentConfig, Cli, Commands};
use nkcli::connection::PairingRequest;
use nkcli::keys::{self, KeyRecord};
use nkcli::orchestrator::Orchestrator;
use nkcli::prompt::{read_line, read_secret, TerminalPrompt};
use nkcli::refresh::RefreshReport;
use nkcli::store::{Database, KeySummary};

use clap::Parser;
use nkc_common::{Pubkey, SigningKeys};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

/// Wraps `text` in `style` when stdout is a terminal.
fn paint(style: &str, text: &str) -> String {
    if tty() {
        format!("{style}{text}{RESET}")
    } else {
        text.to_string()
    }
}

fn ok(msg: &str) {
    println!("  {} {msg}", paint(GREEN, "\u{2713}"));
}

fn fail(msg: &str) {
    println!("  {} {msg}", paint(RED, "\u{2717}"));
}

// ── Shared helpers ──────────────────────────────────────────────────

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

fn resolve_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(ref db) = cli.db {
        config.db = db.clone();
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

fn open_db(config: &AgentConfig) -> anyhow::Result<Database> {
    if let Some(parent) = config.db.parent() {
        std::fs::create_dir_all(parent)?;
    }
    debug!(path = %config.db.display(), "opening database");
    Ok(Database::open(&config.db)?)
}

fn ask_passphrase(question: &str) -> anyhow::Result<Zeroizing<String>> {
    let passphrase = read_secret(question).ok_or_else(|| anyhow::anyhow!("no passphrase given"))?;
    if passphrase.is_empty() {
        anyhow::bail!("passphrase must not be empty");
    }
    Ok(passphrase)
}

fn confirm_passphrase(first: Zeroizing<String>, second: &str) -> anyhow::Result<Zeroizing<String>> {
    if first.as_str() != second {
        anyhow::bail!("passphrases do not match");
    }
    Ok(first)
}

fn ask_new_passphrase() -> anyhow::Result<Zeroizing<String>> {
    let first = ask_passphrase("  Enter a passphrase to protect your key: ")?;
    let second = ask_passphrase("  Repeat the passphrase: ")?;
    confirm_passphrase(first, &second)
}

/// Reads a 1-based choice among `count` entries.
fn choose(question: &str, count: usize) -> anyhow::Result<usize> {
    let line = read_line(question).ok_or_else(|| anyhow::anyhow!("no choice given"))?;
    match line.trim().parse::<usize>() {
        Ok(n) if (1..=count).contains(&n) => Ok(n - 1),
        _ => anyhow::bail!("invalid choice: {line}"),
    }
}

fn confirm(question: &str) -> bool {
    read_line(question).is_some_and(|a| a.trim().eq_ignore_ascii_case("y"))
}

fn print_keys(list: &[KeySummary]) {
    for (i, summary) in list.iter().enumerate() {
        println!("  {}. {}", i + 1, keys::describe(summary));
    }
}

fn print_reports(reports: &[(Pubkey, RefreshReport)]) {
    for (pubkey, report) in reports {
        let line = format!(
            "{} {}",
            nkc_common::keys::encode(pubkey),
            paint(
                DIM,
                &format!(
                    "({} updated, {} relays answered, {} timed out, {} failed)",
                    report.saved, report.complete, report.timed_out, report.failed
                )
            )
        );
        if report.complete > 0 {
            ok(&line);
        } else {
            fail(&line);
        }
    }
}

fn orchestrator(db: Database, config: AgentConfig, cancel: CancellationToken) -> Orchestrator {
    Orchestrator::new(db, Arc::new(TerminalPrompt::new()), config, cancel)
}

fn shutdown_on_ctrl_c(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            cancel.cancel();
        }
    });
}

// ── Commands ────────────────────────────────────────────────────────

async fn serve(config: AgentConfig) -> anyhow::Result<()> {
    let db = open_db(&config)?;
    let conns = db.list_connections()?;
    if conns.is_empty() {
        println!("You don't have any connections.");
        println!("Run '{}' to generate a new key.", paint(BOLD, "nkcli generate"));
        println!("Run '{}' to import a key.", paint(BOLD, "nkcli import <hex>"));
        println!("Run '{}' to create a connection.", paint(BOLD, "nkcli connect <uri>"));
        return Ok(());
    }

    if std::io::stderr().is_terminal() {
        let v = env!("CARGO_PKG_VERSION");
        eprintln!();
        eprintln!("  {BOLD}\u{25c8} nkcli{RESET} {DIM}v{v}{RESET}");
        for conn in &conns {
            eprintln!(
                "  {DIM}App{RESET}  {CYAN}{}{RESET} {DIM}via{RESET} {}",
                conn.metadata.name, conn.relay
            );
        }
        eprintln!();
    }
    println!("Serving {} connections...", conns.len());

    let cancel = CancellationToken::new();
    shutdown_on_ctrl_c(&cancel);
    let served = orchestrator(db, config, cancel).serve().await?;
    info!(sessions = served, "serve finished");
    Ok(())
}

fn generate(config: &AgentConfig) -> anyhow::Result<()> {
    let db = open_db(config)?;
    let signing = SigningKeys::generate();
    let passphrase = ask_new_passphrase()?;
    let pubkey = keys::store_key(&db, &signing, &passphrase)?;
    println!();
    println!("Your public key:");
    println!("{}", paint(CYAN, &nkc_common::keys::encode(&pubkey)));
    Ok(())
}

async fn import(config: AgentConfig, secrets: &[String], relays: &[String]) -> anyhow::Result<()> {
    let db = open_db(&config)?;
    let mut imported = Vec::new();
    for secret in secrets {
        let signing = keys::parse_secret(secret.trim())?;
        let pubkey = signing.public_key();
        let hex = nkc_common::keys::encode(&pubkey);
        if db.has_key(&pubkey)? {
            println!("  {} {hex} already exists, skipped", paint(YELLOW, "\u{2022}"));
            continue;
        }
        let passphrase = ask_passphrase(&format!("  Passphrase for {hex}: "))?;
        keys::store_key(&db, &signing, &passphrase)?;
        ok(&format!("Imported {hex}"));
        imported.push(pubkey);
    }
    if imported.is_empty() {
        return Ok(());
    }

    println!();
    println!("Fetching profiles and relay lists...");
    let cancel = CancellationToken::new();
    shutdown_on_ctrl_c(&cancel);
    let override_relays = (!relays.is_empty()).then_some(relays);
    let reports = orchestrator(db, config, cancel)
        .refresh_some(&imported, override_relays)
        .await?;
    print_reports(&reports);
    Ok(())
}

fn list(config: &AgentConfig) -> anyhow::Result<()> {
    let db = open_db(config)?;
    let keys = db.list_keys()?;
    if keys.is_empty() {
        println!("You don't have any keys, generate or import one.");
        return Ok(());
    }
    println!("You have {} keys:", keys.len());
    println!();
    print_keys(&keys);
    Ok(())
}

fn remove(config: AgentConfig, args: &[String]) -> anyhow::Result<()> {
    let db = open_db(&config)?;
    let targets: Vec<Pubkey> = if args.is_empty() {
        let list = db.list_keys()?;
        if list.is_empty() {
            println!("You don't have any keys, generate or import one.");
            return Ok(());
        }
        println!("You have {} keys:", list.len());
        println!();
        print_keys(&list);
        println!();
        let n = choose("  Choose one key: ", list.len())?;
        vec![list[n].pubkey]
    } else {
        args.iter()
            .map(|a| keys::parse_pubkey(a))
            .collect::<Result<_, _>>()?
    };

    println!("Do you want to DELETE these keys?");
    println!();
    for (i, pubkey) in targets.iter().enumerate() {
        println!("  {}. {}", i + 1, nkc_common::keys::encode(pubkey));
    }
    println!();
    if !confirm("[y/n] ") {
        return Ok(());
    }

    let orch = orchestrator(db, config, CancellationToken::new());
    for pubkey in &targets {
        let hex = nkc_common::keys::encode(pubkey);
        match orch.remove_key(pubkey) {
            Ok(n) => ok(&format!("Key {hex} has been deleted ({n} connections removed)")),
            Err(e) => fail(&format!("{hex}: {e}")),
        }
    }
    Ok(())
}

fn connect(config: AgentConfig, uri: &str, allow_all: bool) -> anyhow::Result<()> {
    let request = PairingRequest::parse(uri).map_err(nkcli::AgentError::from)?;
    println!("  {}  {}", paint(DIM, "App"), paint(BOLD, &request.metadata.name));
    if let Some(url) = &request.metadata.url {
        println!("  {}  {url}", paint(DIM, "URL"));
    }
    if let Some(description) = &request.metadata.description {
        println!("  {}  {description}", paint(DIM, "About"));
    }
    println!("  {}  {}", paint(DIM, "Relay"), request.relay);
    println!();

    let db = open_db(&config)?;
    let list = db.list_keys()?;
    if list.is_empty() {
        println!("You don't have any keys, generate or import one.");
        return Ok(());
    }
    print_keys(&list);
    println!();
    let n = choose("  Choose the key to serve this app: ", list.len())?;

    let orch = orchestrator(db, config, CancellationToken::new());
    orch.add_connection(&request, &list[n].pubkey, allow_all)?;
    if allow_all {
        println!("  {} every permission granted", paint(YELLOW, "!"));
    }
    ok("Connection info saved! Run nkcli without subcommand to serve it.");
    Ok(())
}

async fn disconnect(config: AgentConfig) -> anyhow::Result<()> {
    let db = open_db(&config)?;
    let conns = db.list_connections()?;
    if conns.is_empty() {
        println!("You don't have any connections.");
        return Ok(());
    }
    for (i, conn) in conns.iter().enumerate() {
        println!("  {}. {} {}", i + 1, conn.metadata.name, paint(DIM, &conn.app_id));
    }
    println!();
    let n = choose("  Choose one connection: ", conns.len())?;
    let app = conns[n].app_pubkey()?;
    // Fail early with a clear message if the serving key is gone.
    KeyRecord::load(&db, &conns[n].agent_pubkey()?)?;

    let cancel = CancellationToken::new();
    shutdown_on_ctrl_c(&cancel);
    orchestrator(db, config, cancel).disconnect(&app).await?;
    ok("Your connection has been disconnected.");
    Ok(())
}

async fn update(config: AgentConfig, relays: &[String]) -> anyhow::Result<()> {
    for relay in relays {
        if !(relay.starts_with("ws://") || relay.starts_with("wss://")) {
            anyhow::bail!("invalid relay URL: {relay}");
        }
    }
    let db = open_db(&config)?;
    let count = db.list_keys()?.len();
    println!("Found {count} keys");
    println!();

    let cancel = CancellationToken::new();
    shutdown_on_ctrl_c(&cancel);
    let override_relays = (!relays.is_empty()).then_some(relays);
    let reports = orchestrator(db, config, cancel).refresh(override_relays).await?;
    print_reports(&reports);
    Ok(())
}

/// How long shutdown waits for blocking work, such as a terminal prompt
/// still reading stdin.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

async fn run(cli: &Cli, config: AgentConfig) -> anyhow::Result<()> {
    match cli.command.as_ref().unwrap_or(&Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Generate => generate(&config)?,
        Commands::Import { keys, relays } => import(config, keys, relays).await?,
        Commands::List => list(&config)?,
        Commands::Remove { pubkeys } => remove(config, pubkeys)?,
        Commands::Connect { uri, allow_all } => connect(config, uri, *allow_all)?,
        Commands::Disconnect => disconnect(config).await?,
        Commands::Update { relays } => update(config, relays).await?,
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Failed to install rustls crypto provider - may already be installed or unsupported platform");
    }

    let cli = Cli::parse();

    init_tracing(&cli)?;
    let config = resolve_config(&cli)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(&cli, config));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}
