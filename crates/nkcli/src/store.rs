//! Persistent storage for keys, metadata snapshots and connections.
//!
//! [`KvStore`] is the ordered byte-keyed store with named partitions;
//! [`SledStore`] backs it on disk and [`MemoryStore`] in memory.
//! [`Database`] layers the typed operations on top. Every method is a
//! single store call, so nothing is held open across a prompt or a
//! network round trip.

use crate::connection::Connection;
use nkc_common::types::kind;
use nkc_common::{Event, Pubkey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Named store partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Public key → sealed private key.
    Keys,
    /// Public key → latest profile event (JSON).
    Profiles,
    /// Public key → latest relay-list event (JSON).
    RelayLists,
    /// Application public key → connection record (JSON).
    Connections,
}

impl Partition {
    /// All partitions, in creation order.
    pub const ALL: [Self; 4] = [
        Self::Keys,
        Self::Profiles,
        Self::RelayLists,
        Self::Connections,
    ];

    /// On-disk partition name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Keys => "keys",
            Self::Profiles => "profiles",
            Self::RelayLists => "relay-lists",
            Self::Connections => "connections",
        }
    }
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The sled backend failed.
    #[error("database: {0}")]
    Sled(#[from] sled::Error),
    /// A stored record failed to decode.
    #[error("corrupt record in {partition}: {reason}")]
    Corrupt {
        /// Partition holding the record.
        partition: &'static str,
        /// Decode failure.
        reason: String,
    },
    /// Filesystem error preparing the database directory.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered byte-keyed store with named partitions.
pub trait KvStore: Send + Sync {
    /// Reads one value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get(&self, partition: Partition, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Writes one value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn put(&self, partition: Partition, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Deletes one value. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn delete(&self, partition: Partition, key: &[u8]) -> Result<(), StoreError>;

    /// Returns every entry of a partition in key order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn scan(&self, partition: Partition) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// sled-backed store, one tree per partition.
pub struct SledStore {
    db: sled::Db,
    trees: HashMap<Partition, sled::Tree>,
}

impl SledStore {
    /// Opens (or creates) a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory cannot be created or sled
    /// fails to open.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::Config::new().path(path).open()?;
        let mut trees = HashMap::with_capacity(Partition::ALL.len());
        for p in Partition::ALL {
            trees.insert(p, db.open_tree(p.name())?);
        }
        info!(path = %path.display(), "database opened");
        Ok(Self { db, trees })
    }

    fn tree(&self, partition: Partition) -> Result<&sled::Tree, StoreError> {
        self.trees
            .get(&partition)
            .ok_or_else(|| corrupt(partition, "partition not opened"))
    }

    /// Flushes dirty pages to disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if sled fails to flush.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl KvStore for SledStore {
    fn get(&self, partition: Partition, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree(partition)?.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, partition: Partition, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let tree = self.tree(partition)?;
        tree.insert(key, value)?;
        tree.flush()?;
        Ok(())
    }

    fn delete(&self, partition: Partition, key: &[u8]) -> Result<(), StoreError> {
        let tree = self.tree(partition)?;
        tree.remove(key)?;
        tree.flush()?;
        Ok(())
    }

    fn scan(&self, partition: Partition) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.tree(partition)?
            .iter()
            .map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(StoreError::from))
            .collect()
    }
}

type Partitions = HashMap<Partition, BTreeMap<Vec<u8>, Vec<u8>>>;

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Partitions>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Partitions> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("memory store lock poisoned, using recovered data");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Partitions> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("memory store lock poisoned, using recovered data");
                poisoned.into_inner()
            }
        }
    }
}

impl KvStore for MemoryStore {
    fn get(&self, partition: Partition, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .read()
            .get(&partition)
            .and_then(|t| t.get(key))
            .cloned())
    }

    fn put(&self, partition: Partition, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write()
            .entry(partition)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, partition: Partition, key: &[u8]) -> Result<(), StoreError> {
        if let Some(t) = self.write().get_mut(&partition) {
            t.remove(key);
        }
        Ok(())
    }

    fn scan(&self, partition: Partition) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .read()
            .get(&partition)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

/// Profile fields shown next to a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    /// `display_name` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// `name` field (handle).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `nip05` identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
}

impl ProfileMetadata {
    /// Reads profile fields from a kind-0 event's content.
    #[must_use]
    pub fn from_event(event: &Event) -> Option<Self> {
        serde_json::from_str(&event.content).ok()
    }

    /// Renders `display_name @name <nip05>`, or `None` if all are empty.
    #[must_use]
    pub fn label(&self) -> Option<String> {
        let parts: Vec<String> = [
            self.display_name.clone(),
            self.name.as_ref().map(|n| format!("@{n}")),
            self.nip05.as_ref().map(|n| format!("<{n}>")),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty() && s != "@" && s != "<>")
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Read/write markers for one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAttr {
    /// Reads from this relay.
    pub read: bool,
    /// Writes to this relay.
    pub write: bool,
}

/// Relay URL → markers.
pub type RelayMap = BTreeMap<String, RelayAttr>;

/// Reads a relay map from a kind-10002 event.
///
/// `r` tags take precedence (`["r", url]` is read+write, a third element
/// of `read` or `write` restricts it). Without `r` tags the content is
/// read as a JSON `{url: {read, write}}` map.
#[must_use]
pub fn relay_map_from_event(event: &Event) -> RelayMap {
    let mut map = RelayMap::new();
    for tag in &event.tags {
        if tag.first().map(String::as_str) != Some("r") {
            continue;
        }
        let Some(url) = tag.get(1) else { continue };
        let attr = match tag.get(2).map(String::as_str) {
            Some("read") => RelayAttr {
                read: true,
                write: false,
            },
            Some("write") => RelayAttr {
                read: false,
                write: true,
            },
            _ => RelayAttr {
                read: true,
                write: true,
            },
        };
        map.insert(url.clone(), attr);
    }
    if map.is_empty() {
        map = serde_json::from_str(&event.content).unwrap_or_default();
    }
    map
}

/// One stored key with its snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySummary {
    /// Public key.
    pub pubkey: Pubkey,
    /// Latest profile snapshot.
    pub profile: Option<ProfileMetadata>,
    /// Latest relay list.
    pub relays: RelayMap,
}

/// Typed view over a [`KvStore`].
///
/// Clones share one write lock. Read-then-write operations hold it so a
/// concurrent writer cannot slip in between the check and the write.
#[derive(Clone)]
pub struct Database {
    kv: Arc<dyn KvStore>,
    writes: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

fn corrupt(partition: Partition, e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        partition: partition.name(),
        reason: e.to_string(),
    }
}

impl Database {
    /// Wraps a store.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            writes: Arc::new(Mutex::new(())),
        }
    }

    fn write_lock(&self) -> MutexGuard<'_, ()> {
        match self.writes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("database write lock poisoned, continuing");
                poisoned.into_inner()
            }
        }
    }

    /// Opens a sled database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if sled fails to open.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(SledStore::open(path)?)))
    }

    /// Creates an empty in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    // ── Keys ────────────────────────────────────────────────────────────

    /// Stores a sealed private key under its public key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn save_key(&self, pubkey: &Pubkey, sealed: &[u8]) -> Result<(), StoreError> {
        self.kv.put(Partition::Keys, pubkey, sealed)
    }

    /// Returns `true` if a key is stored under `pubkey`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn has_key(&self, pubkey: &Pubkey) -> Result<bool, StoreError> {
        Ok(self.kv.get(Partition::Keys, pubkey)?.is_some())
    }

    /// Returns the sealed private key for `pubkey`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn key_blob(&self, pubkey: &Pubkey) -> Result<Option<Vec<u8>>, StoreError> {
        self.kv.get(Partition::Keys, pubkey)
    }

    /// Lists stored keys with their profile and relay snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a read fails.
    pub fn list_keys(&self) -> Result<Vec<KeySummary>, StoreError> {
        let mut out = Vec::new();
        for (k, _) in self.kv.scan(Partition::Keys)? {
            let Ok(pubkey) = <Pubkey>::try_from(k.as_slice()) else {
                warn!(len = k.len(), "skipping malformed key entry");
                continue;
            };
            out.push(KeySummary {
                pubkey,
                profile: self.profile(&pubkey)?,
                relays: self.relay_list(&pubkey)?,
            });
        }
        Ok(out)
    }

    /// Removes a key, its snapshots and every connection served by it.
    ///
    /// Returns the number of connections removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a read or write fails.
    pub fn remove_key(&self, pubkey: &Pubkey) -> Result<usize, StoreError> {
        let _guard = self.write_lock();
        self.kv.delete(Partition::Keys, pubkey)?;
        self.kv.delete(Partition::Profiles, pubkey)?;
        self.kv.delete(Partition::RelayLists, pubkey)?;

        let owner = nkc_common::keys::encode(pubkey);
        let mut removed = 0;
        for conn in self.list_connections()? {
            if conn.pubkey == owner {
                if let Ok(app) = conn.app_pubkey() {
                    self.kv.delete(Partition::Connections, &app)?;
                    removed += 1;
                }
            }
        }
        info!(pubkey = %owner, connections = removed, "key removed");
        Ok(removed)
    }

    // ── Metadata snapshots ──────────────────────────────────────────────

    /// Stores a profile or relay-list event as the latest snapshot for
    /// its author. An older event never replaces a newer one, even when
    /// two saves for the same author race.
    ///
    /// Returns `true` if the snapshot was written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the event author is malformed or a
    /// read or write fails.
    pub fn save_event(&self, event: &Event) -> Result<bool, StoreError> {
        let partition = match event.kind {
            kind::METADATA => Partition::Profiles,
            kind::RELAY_LIST => Partition::RelayLists,
            other => {
                debug!(kind = other, "ignoring event of unrelated kind");
                return Ok(false);
            }
        };
        let author = event.author().map_err(|e| corrupt(partition, e))?;
        let _guard = self.write_lock();
        if let Some(existing) = self.stored_event(partition, &author)? {
            if existing.created_at > event.created_at {
                debug!(kind = event.kind, "keeping newer snapshot");
                return Ok(false);
            }
        }
        let bytes = serde_json::to_vec(event).map_err(|e| corrupt(partition, e))?;
        self.kv.put(partition, &author, &bytes)?;
        debug!(kind = event.kind, pubkey = %event.pubkey, "snapshot saved");
        Ok(true)
    }

    fn stored_event(&self, partition: Partition, pubkey: &Pubkey) -> Result<Option<Event>, StoreError> {
        match self.kv.get(partition, pubkey)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| corrupt(partition, e)),
            None => Ok(None),
        }
    }

    /// Returns the profile snapshot for `pubkey`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails or the record is corrupt.
    pub fn profile(&self, pubkey: &Pubkey) -> Result<Option<ProfileMetadata>, StoreError> {
        Ok(self
            .stored_event(Partition::Profiles, pubkey)?
            .and_then(|e| ProfileMetadata::from_event(&e)))
    }

    /// Returns the relay list for `pubkey` (empty if unknown).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails or the record is corrupt.
    pub fn relay_list(&self, pubkey: &Pubkey) -> Result<RelayMap, StoreError> {
        Ok(self
            .stored_event(Partition::RelayLists, pubkey)?
            .map(|e| relay_map_from_event(&e))
            .unwrap_or_default())
    }

    // ── Connections ─────────────────────────────────────────────────────

    /// Lists every stored connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if any record fails to decode.
    pub fn list_connections(&self) -> Result<Vec<Connection>, StoreError> {
        self.kv
            .scan(Partition::Connections)?
            .into_iter()
            .map(|(_, v)| {
                serde_json::from_slice(&v).map_err(|e| corrupt(Partition::Connections, e))
            })
            .collect()
    }

    /// Returns the connection for application `app`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails or the record is corrupt.
    pub fn get_connection(&self, app: &Pubkey) -> Result<Option<Connection>, StoreError> {
        match self.kv.get(Partition::Connections, app)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| corrupt(Partition::Connections, e)),
            None => Ok(None),
        }
    }

    /// Writes a connection record, replacing any previous one for its app.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the app key is malformed or the write fails.
    pub fn put_connection(&self, conn: &Connection) -> Result<(), StoreError> {
        let app = conn
            .app_pubkey()
            .map_err(|e| corrupt(Partition::Connections, e))?;
        let bytes = serde_json::to_vec(conn).map_err(|e| corrupt(Partition::Connections, e))?;
        let _guard = self.write_lock();
        self.kv.put(Partition::Connections, &app, &bytes)
    }

    /// Rewrites a connection record only if one is still stored for its
    /// app. Returns `false`, writing nothing, once the connection has been
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the app key is malformed or a read or
    /// write fails.
    pub fn update_connection(&self, conn: &Connection) -> Result<bool, StoreError> {
        let app = conn
            .app_pubkey()
            .map_err(|e| corrupt(Partition::Connections, e))?;
        let bytes = serde_json::to_vec(conn).map_err(|e| corrupt(Partition::Connections, e))?;
        let _guard = self.write_lock();
        if self.kv.get(Partition::Connections, &app)?.is_none() {
            debug!(app = %conn.app_id, "connection gone, not updating");
            return Ok(false);
        }
        self.kv.put(Partition::Connections, &app, &bytes)?;
        Ok(true)
    }

    /// Removes the connection for application `app`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn remove_connection(&self, app: &Pubkey) -> Result<(), StoreError> {
        let _guard = self.write_lock();
        self.kv.delete(Partition::Connections, app)
    }
}
