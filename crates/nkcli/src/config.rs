use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI interface for the signing agent.
#[derive(Parser)]
#[command(name = "nkcli", about = "Nostr key custody and remote signing agent")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute. Serves stored connections when omitted.
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database path override.
    #[arg(short = 'd', long, global = true, env = "NKCLI_DB")]
    pub db: Option<PathBuf>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Serve every stored connection until interrupted.
    Serve,
    /// Generate a new key.
    #[command(alias = "g")]
    Generate,
    /// Import hex-encoded private keys.
    #[command(alias = "i")]
    Import {
        /// Private keys (64 hex characters each).
        #[arg(required = true)]
        keys: Vec<String>,
        /// Relays to fetch metadata from (defaults to the bootstrap list).
        #[arg(short, long = "relay")]
        relays: Vec<String>,
    },
    /// List stored keys.
    #[command(alias = "l")]
    List,
    /// Remove keys and the connections they serve.
    Remove {
        /// Public keys to remove; prompts for a choice when empty.
        pubkeys: Vec<String>,
    },
    /// Create a connection from a `nostrconnect://` URI.
    #[command(alias = "c")]
    Connect {
        /// The pairing URI.
        uri: String,
        /// Grant every permission up front.
        #[arg(short = 'A', long)]
        allow_all: bool,
    },
    /// Disconnect and remove a stored connection.
    Disconnect,
    /// Refresh profile and relay-list snapshots for stored keys.
    #[command(alias = "u")]
    Update {
        /// Relays to query (defaults to each key's read relays, or the bootstrap list when it has none).
        #[arg(short, long = "relay")]
        relays: Vec<String>,
    },
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Database path.
    pub db: PathBuf,
    /// Bootstrap relays used for metadata refresh.
    pub relays: Vec<String>,
    /// Capacity of the shared dispatch queue.
    pub queue_capacity: usize,
    /// Relay refresh settings.
    pub refresh: RefreshConfig,
    /// WebSocket keepalive ping settings.
    pub keepalive: KeepaliveConfig,
}

/// Relay refresh fan-out settings.
#[derive(Debug, Deserialize, Clone)]
pub struct RefreshConfig {
    /// Per-relay subscription timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Maximum events requested per relay.
    pub limit: usize,
}

/// WebSocket keepalive settings.
#[derive(Debug, Deserialize, Clone)]
pub struct KeepaliveConfig {
    /// Interval between keepalive pings, in seconds.
    pub interval_s: u64,
}

/// Relays queried when a key has no known relay list.
pub const DEFAULT_RELAYS: [&str; 4] = [
    "wss://relay.damus.io",
    "wss://nostr.bitcoiner.social",
    "wss://eden.nostr.land",
    "wss://relay.nostr.band",
];

/// Resolves the default database location under the platform data dir.
#[must_use]
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nkcli")
        .join("db")
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            limit: 2,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { interval_s: 30 }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            db: default_db_path(),
            relays: DEFAULT_RELAYS.iter().map(ToString::to_string).collect(),
            queue_capacity: 10,
            refresh: RefreshConfig::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.db.as_os_str().is_empty() {
            return Err("db path must not be empty".to_string());
        }
        for relay in &self.relays {
            if !(relay.starts_with("ws://") || relay.starts_with("wss://")) {
                return Err(format!(
                    "relay URL must start with ws:// or wss://, got: {relay}"
                ));
            }
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }
        if self.refresh.timeout_ms == 0 {
            return Err("refresh.timeout_ms must be greater than 0".to_string());
        }
        if self.refresh.limit == 0 {
            return Err("refresh.limit must be greater than 0".to_string());
        }
        if self.keepalive.interval_s == 0 {
            return Err("keepalive.interval_s must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    let defaults = AgentConfig::default();
    let mut builder = config::Config::builder()
        .set_default("db", defaults.db.to_string_lossy().as_ref())?
        .set_default("relays", defaults.relays.clone())?
        .set_default("queue_capacity", defaults.queue_capacity as i64)?
        .set_default("refresh.timeout_ms", defaults.refresh.timeout_ms as i64)?
        .set_default("refresh.limit", defaults.refresh.limit as i64)?
        .set_default("keepalive.interval_s", defaults.keepalive.interval_s as i64)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        // Platform-native config dir first, then ~/.config/nkcli/
        let native_path = dirs::config_dir().map(|d| d.join("nkcli").join("config.toml"));
        let xdg_path = dirs::home_dir().map(|d| d.join(".config").join("nkcli").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    // Double underscore separates nesting so `queue_capacity` stays one key.
    builder = builder.add_source(
        config::Environment::with_prefix("NKCLI")
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("relays")
            .try_parsing(true),
    );

    let settings = builder.build()?;
    let config: AgentConfig = settings.try_deserialize()?;

    Ok(config)
}
